use std::{path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use tokio::{signal, sync::oneshot};

use fl_coordinator::{
    aggregator::FederatedAveraging,
    common::logging,
    registry::{HeartbeatSweeper, RegistryService},
    rest,
    round::RoundCoordinator,
    session::SessionManager,
    settings::Settings,
    storage::{FileStore, NoopStore, SessionStore},
    transport::{
        control::{self, redis::RedisSubscriber},
        rpc::RpcTaskTransport,
    },
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        log: log_settings,
        registry: registry_settings,
        round: round_settings,
        session: session_settings,
        control: control_settings,
        api: api_settings,
        storage: storage_settings,
    } = settings;

    logging::configure(log_settings).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });

    let (registry_service, registry) = RegistryService::new(registry_settings.heartbeat_timeout());
    tokio::spawn(registry_service.run());
    let sweeper = HeartbeatSweeper::new(registry.clone(), registry_settings.sweep_interval()).spawn();

    let subscriber = RedisSubscriber::connect(&control_settings.url, &control_settings.channel)
        .await
        .unwrap_or_else(|err| {
            error!("failed to subscribe to the control channel: {}", err);
            process::exit(1);
        });
    let control_listener = tokio::spawn(control::listen(subscriber, registry.clone()));

    let store: Arc<dyn SessionStore> = match storage_settings.directory {
        Some(directory) => Arc::new(FileStore::new(directory).await.unwrap_or_else(|err| {
            error!("failed to initialize storage: {:?}", err);
            process::exit(1);
        })),
        None => Arc::new(NoopStore),
    };

    let transport = Arc::new(RpcTaskTransport::new(round_settings.rpc_timeout()));
    let coordinator = RoundCoordinator::new(
        registry.clone(),
        transport,
        Arc::new(FederatedAveraging),
        round_settings,
    );
    let (mut session, events) = SessionManager::new(coordinator, session_settings, store);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let api = rest::serve(api_settings, events, registry, async {
        let _ = shutdown_rx.await;
    })
    .unwrap_or_else(|err| {
        error!("failed to start the REST API: {}", err);
        process::exit(1);
    });
    let api = tokio::spawn(api);

    tokio::select! {
        result = session.run() => match result {
            Ok(artifact) => info!("session finalized, model version {:?}", artifact.version()),
            Err(err) => error!("session ended: {}", err),
        },
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = api.await;
    sweeper.shutdown().await;
    control_listener.abort();
}
