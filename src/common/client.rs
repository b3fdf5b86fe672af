use derive_more::{Display, From};
use std::{collections::BTreeSet, fmt, io, path::Path, str::FromStr};
use uuid::{self, Uuid};

#[derive(
    Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display, Serialize, Deserialize, From,
)]
/// A unique client identifier, stable across restarts of the client.
pub struct ClientId(Uuid);

impl ClientId {
    /// Return a new random client identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Read the identifier stored at `path`, or generate a new one and
    /// persist it there so the next start reuses it.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => content
                .trim()
                .parse()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let id = Self::new();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, id.to_string())?;
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;
    fn from_str(uuid_str: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(uuid_str)?))
    }
}

/// Network address of a client's task server.
#[derive(Eq, PartialEq, Hash, Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// An endpoint is usable when it names a host and a non-zero port.
    pub fn is_valid(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What a client is able to work on.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub datasets: BTreeSet<String>,
    #[serde(default)]
    pub models: BTreeSet<String>,
}

impl Capabilities {
    pub fn new<D, M>(datasets: D, models: M) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
    {
        Self {
            datasets: datasets.into_iter().map(Into::into).collect(),
            models: models.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether these capabilities cover everything listed in `required`.
    pub fn satisfies(&self, required: &Capabilities) -> bool {
        self.datasets.is_superset(&required.datasets) && self.models.is_superset(&required.models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_superset() {
        let client = Capabilities::new(vec!["mnist", "cifar10"], vec!["cnn"]);
        assert!(client.satisfies(&Capabilities::new(vec!["mnist"], vec!["cnn"])));
        assert!(client.satisfies(&Capabilities::default()));
        assert!(!client.satisfies(&Capabilities::new(vec!["femnist"], Vec::<String>::new())));
        assert!(!client.satisfies(&Capabilities::new(Vec::<String>::new(), vec!["resnet"])));
    }

    #[test]
    fn endpoint_validity() {
        assert!(Endpoint::new("10.0.0.1", 8080).is_valid());
        assert!(!Endpoint::new("", 8080).is_valid());
        assert!(!Endpoint::new("  ", 8080).is_valid());
        assert!(!Endpoint::new("localhost", 0).is_valid());
        assert_eq!(Endpoint::new("localhost", 9000).to_string(), "localhost:9000");
    }

    #[test]
    fn client_id_is_persisted() {
        let dir = std::env::temp_dir().join(format!("fl-client-id-{}", Uuid::new_v4()));
        let path = dir.join("client_id");
        let first = ClientId::load_or_create(&path).unwrap();
        let second = ClientId::load_or_create(&path).unwrap();
        assert_eq!(first, second);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
