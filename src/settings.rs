//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables, e.g.
//! `FLCOORD_ROUND__MIN_CLIENTS=4`. An example configuration file lives in `configs/`.

use std::{collections::BTreeMap, fmt, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::de::{self, Deserializer, Visitor};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::round::{retry::RetryPolicy, selector::SamplingPolicy};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub log: LoggingSettings,
    #[validate]
    pub registry: RegistrySettings,
    #[validate]
    pub round: RoundSettings,
    #[validate]
    pub session: SessionSettings,
    pub control: ControlSettings,
    pub api: ApiSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("flcoord")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Client liveness settings.
pub struct RegistrySettings {
    /// Seconds without a heartbeat after which a client is marked unreachable.
    #[validate(range(min = 1))]
    pub heartbeat_timeout: u64,
    /// Seconds between two liveness sweeps.
    #[validate(range(min = 1))]
    pub sweep_interval: u64,
}

impl RegistrySettings {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_round"))]
/// Settings of a single round.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [round]
/// min_clients = 4
/// min_success = 3
/// deadline = 600
/// rpc_timeout = 120
///
/// [round.sampling]
/// policy = "uniform"
/// count = 8
/// seed = 42
///
/// [round.retry]
/// max_retries = 2
/// initial_backoff_ms = 500
/// max_backoff_ms = 5000
/// ```
pub struct RoundSettings {
    pub sampling: SamplingPolicy,
    /// The minimal number of eligible clients needed to start a round.
    pub min_clients: usize,
    /// The minimal number of successful clients needed to aggregate.
    pub min_success: usize,
    /// Seconds after dispatch at which outstanding clients time out.
    pub deadline: u64,
    /// Seconds a single RPC attempt may take.
    pub rpc_timeout: u64,
    pub retry: RetryPolicy,
}

impl RoundSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout)
    }

    fn validate_round(&self) -> Result<(), ValidationError> {
        if self.min_success == 0 || self.min_clients == 0 {
            return Err(ValidationError::new("counts must be at least one"));
        }
        if self.min_success > self.min_clients {
            return Err(ValidationError::new("quorum larger than minimal client count"));
        }
        if let SamplingPolicy::Uniform { count, .. } = self.sampling {
            if count < self.min_clients {
                return Err(ValidationError::new("sample smaller than minimal client count"));
            }
        }
        if self.deadline == 0 || self.rpc_timeout == 0 {
            return Err(ValidationError::new("timeouts must be positive"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ValidationError::new("invalid backoff range"));
        }
        Ok(())
    }
}

fn validate_round(s: &RoundSettings) -> Result<(), ValidationError> {
    s.validate_round()
}

/// What the session does when a round cannot find enough eligible clients.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InsufficientClientsPolicy {
    /// Wait `retry_delay` and try the round again, within `max_round_retries`.
    Retry,
    /// Abort the session immediately.
    Abort,
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Settings of a training session.
pub struct SessionSettings {
    /// The number of rounds to run.
    #[validate(range(min = 1))]
    pub rounds: u32,
    /// How often a failed round is retried before the session aborts.
    pub max_round_retries: u32,
    /// Seconds to wait before retrying a round.
    pub retry_delay: u64,
    pub on_insufficient_clients: InsufficientClientsPolicy,
    /// Run a benchmark round before training.
    #[serde(default)]
    pub benchmark_first: bool,
    /// Compute parameter statistics of every new model on the server.
    #[serde(default)]
    pub validate_artifacts: bool,
    pub task: TaskSettings,
    /// The number of parameters of the initial model.
    #[validate(range(min = 1))]
    pub model_size: usize,
}

impl SessionSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}

#[derive(Debug, Deserialize, Clone)]
/// The workload sent to the clients.
pub struct TaskSettings {
    pub dataset: String,
    pub model: String,
    #[serde(default)]
    pub hyperparams: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize, Clone)]
/// Redis pub/sub settings of the control channel.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [control]
/// url = "redis://127.0.0.1/"
/// channel = "fl-control"
/// ```
pub struct ControlSettings {
    pub url: String,
    pub channel: String,
}

#[derive(Debug, Deserialize, Clone)]
/// REST API settings.
pub struct ApiSettings {
    /// The address to which the REST API is bound.
    pub bind_address: SocketAddr,
}

#[derive(Debug, Deserialize, Clone, Default)]
/// Persistence settings. Without a directory nothing is written.
pub struct StorageSettings {
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives, e.g. `info,fl_coordinator::round=debug`.
    #[serde(default = "default_env_filter")]
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::new("info")
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value).map_err(E::custom)
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
