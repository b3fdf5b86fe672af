//! A simulated client: registers on the control channel, keeps sending
//! heartbeats and answers tasks with deterministic synthetic results.

use std::{collections::BTreeMap, path::PathBuf, process, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use structopt::StructOpt;
use tokio::{signal, time::interval};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fl_coordinator::{
    common::{Capabilities, ClientId, Endpoint, Metrics},
    transport::{
        control::{redis::RedisPublisher, ControlMessage, ControlPublisher},
        rpc,
        EvaluationReport,
        ModelUpdate,
        TaskExecutor,
        TaskFailure,
    },
};

#[macro_use]
extern crate tracing;

/// Heartbeats between two re-registrations.
const REREGISTER_EVERY: u64 = 10;

#[derive(Debug, StructOpt)]
#[structopt(name = "fl-client")]
struct Opt {
    /// URL of the Redis server carrying the control channel
    #[structopt(long, default_value = "redis://127.0.0.1/")]
    redis_url: String,
    /// Name of the control channel
    #[structopt(long, default_value = "fl-control")]
    channel: String,
    /// Host the task server binds to and advertises
    #[structopt(long, default_value = "127.0.0.1")]
    host: String,
    /// Port of the task server, 0 for any free port
    #[structopt(long, default_value = "0")]
    port: u16,
    /// File holding the client identifier across restarts
    #[structopt(long, parse(from_os_str), default_value = "client_id")]
    id_file: PathBuf,
    /// Datasets held by this client
    #[structopt(long, default_value = "mnist", use_delimiter = true)]
    datasets: Vec<String>,
    /// Models this client can train
    #[structopt(long, default_value = "cnn", use_delimiter = true)]
    models: Vec<String>,
    /// Seconds between two heartbeats
    #[structopt(long, default_value = "5")]
    heartbeat_interval: u64,
    /// Number of local samples reported to the coordinator
    #[structopt(long, default_value = "100")]
    samples: u64,
    /// Logging directives
    #[structopt(long, default_value = "info")]
    log: String,
}

/// Pretends to train towards a model whose weights are all one.
struct SyntheticExecutor {
    samples: u64,
}

impl SyntheticExecutor {
    fn loss(parameters: &[f32]) -> f64 {
        if parameters.is_empty() {
            return 0.0;
        }
        let sum: f64 = parameters
            .iter()
            .map(|p| (1.0 - *p as f64).powi(2))
            .sum();
        sum / parameters.len() as f64
    }

    fn report(&self, parameters: &[f32]) -> EvaluationReport {
        let loss = Self::loss(parameters);
        let metrics: Metrics = vec![
            ("loss".to_string(), loss),
            ("accuracy".to_string(), 1.0 / (1.0 + loss)),
        ]
        .into_iter()
        .collect();
        EvaluationReport {
            metrics,
            num_samples: self.samples,
        }
    }
}

#[async_trait]
impl TaskExecutor for SyntheticExecutor {
    async fn benchmark(&self, dataset: &str, model: &str) -> Result<EvaluationReport, TaskFailure> {
        info!("benchmarking {} on {}", model, dataset);
        Ok(EvaluationReport {
            metrics: vec![("samples".to_string(), self.samples as f64)]
                .into_iter()
                .collect(),
            num_samples: self.samples,
        })
    }

    async fn train(
        &self,
        dataset: &str,
        model: &str,
        hyperparams: &BTreeMap<String, f64>,
        parameters: &[f32],
    ) -> Result<ModelUpdate, TaskFailure> {
        let learning_rate = hyperparams.get("learning_rate").copied().unwrap_or(0.1) as f32;
        if !learning_rate.is_finite() || learning_rate <= 0.0 {
            return Err(TaskFailure(format!("invalid learning rate {}", learning_rate)));
        }
        info!("training {} on {} ({} parameters)", model, dataset, parameters.len());
        let delta = parameters
            .iter()
            .map(|p| learning_rate * (1.0 - p))
            .collect();
        Ok(ModelUpdate {
            delta,
            num_samples: self.samples,
            metrics: self.report(parameters).metrics,
        })
    }

    async fn validate(
        &self,
        dataset: &str,
        model: &str,
        parameters: &[f32],
    ) -> Result<EvaluationReport, TaskFailure> {
        info!("validating {} on {}", model, dataset);
        Ok(self.report(parameters))
    }
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let filter = EnvFilter::try_new(&opt.log).unwrap_or_else(|err| {
        eprintln!("invalid log filter: {}", err);
        process::exit(1);
    });
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(true)
        .init();

    let id = ClientId::load_or_create(&opt.id_file).unwrap_or_else(|err| {
        error!("failed to load the client id from {}: {}", opt.id_file.display(), err);
        process::exit(1);
    });
    info!("client id {}", id);

    let executor = Arc::new(SyntheticExecutor {
        samples: opt.samples,
    });
    let (addr, server) = rpc::bind((opt.host.clone(), opt.port), executor)
        .await
        .unwrap_or_else(|err| {
            error!("failed to bind the task server: {}", err);
            process::exit(1);
        });
    info!("task server listening on {}", addr);
    let server = tokio::spawn(server);

    let publisher = RedisPublisher::connect(&opt.redis_url, &opt.channel)
        .await
        .unwrap_or_else(|err| {
            error!("failed to connect to the control channel: {}", err);
            process::exit(1);
        });
    let register = ControlMessage::Register {
        client_id: id,
        endpoint: Endpoint::new(opt.host.clone(), addr.port()),
        capabilities: Capabilities::new(opt.datasets.clone(), opt.models.clone()),
    };

    let mut ticks = interval(Duration::from_secs(opt.heartbeat_interval.max(1)));
    let mut beats: u64 = 0;
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                // the first tick fires immediately and registers
                let message = if beats % REREGISTER_EVERY == 0 {
                    register.clone()
                } else {
                    ControlMessage::Heartbeat { client_id: id, timestamp: Utc::now() }
                };
                if let Err(err) = publisher.publish(&message).await {
                    warn!("failed to publish on the control channel: {}", err);
                }
                beats += 1;
            }
            _ = signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    server.abort();
}
