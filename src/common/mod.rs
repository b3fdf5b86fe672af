pub mod artifact;
pub mod client;
pub mod logging;

pub use self::{
    artifact::{GlobalArtifact, Metrics},
    client::{Capabilities, ClientId, Endpoint},
};
