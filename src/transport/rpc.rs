//! The task channel over tarpc, with JSON framing on top of TCP.

use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use futures::{future, StreamExt};
use tarpc::{
    client,
    context,
    serde_transport::tcp,
    server::{BaseChannel, Channel},
    tokio_serde::formats::Json,
};
use tokio::{net::ToSocketAddrs, sync::Mutex};
use tracing::Instrument;

use super::task::{
    execute,
    ClientTaskError,
    TaskEnvelope,
    TaskExecutor,
    TaskFailure,
    TaskPayload,
    TaskTransport,
};
use crate::common::Endpoint;

/// Model parameters travel as JSON arrays, so frames can get large.
const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

mod inner {
    use crate::transport::task::{TaskEnvelope, TaskFailure, TaskPayload};

    #[tarpc::service]
    pub trait TaskRpc {
        async fn run_task(envelope: TaskEnvelope) -> Result<TaskPayload, TaskFailure>;
    }
}
pub use inner::{TaskRpc, TaskRpcClient};

/// Serves the tasks of one client connection.
#[derive(Clone)]
struct TaskServer(Arc<dyn TaskExecutor>);

impl TaskRpc for TaskServer {
    async fn run_task(
        self,
        _: context::Context,
        envelope: TaskEnvelope,
    ) -> Result<TaskPayload, TaskFailure> {
        let span = debug_span!(
            "rpc_run_task",
            round = envelope.round,
            kind = %envelope.request.kind(),
            attempt = envelope.attempt
        );
        execute(self.0.as_ref(), envelope).instrument(span).await
    }
}

/// Bind the task server to `addr`.
///
/// Returns the bound address and the future that accepts and serves
/// connections; it runs until it is dropped.
pub async fn bind<A: ToSocketAddrs>(
    addr: A,
    executor: Arc<dyn TaskExecutor>,
) -> io::Result<(SocketAddr, impl Future<Output = ()>)> {
    let mut listener = tcp::listen(addr, Json::default).await?;
    listener.config_mut().max_frame_length(MAX_FRAME_LENGTH);
    let local_addr = listener.local_addr();

    let serve = listener
        .filter_map(|accepted| {
            future::ready(match accepted {
                Ok(transport) => Some(transport),
                Err(e) => {
                    error!("failed to accept RPC connection: {:?}", e);
                    None
                }
            })
        })
        .map(BaseChannel::with_defaults)
        .map(move |channel| {
            let server = TaskServer(executor.clone());
            channel.execute(server.serve()).for_each(spawn)
        })
        .buffer_unordered(64)
        .for_each(|_| async {});
    Ok((local_addr, serve))
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

/// A [`TaskTransport`] issuing tasks over tarpc.
///
/// One connection per client endpoint is kept open and reused across rounds.
/// A connection is dropped after any failure and re-established by the next
/// call.
pub struct RpcTaskTransport {
    clients: Mutex<HashMap<Endpoint, TaskRpcClient>>,
    /// Upper bound on a single call, enforced by the server side as well.
    call_timeout: Duration,
}

impl RpcTaskTransport {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            call_timeout,
        }
    }

    async fn client(&self, endpoint: &Endpoint) -> Result<TaskRpcClient, ClientTaskError> {
        if let Some(client) = self.clients.lock().await.get(endpoint) {
            return Ok(client.clone());
        }

        debug!("connecting to client task server at {}", endpoint);
        let mut connect = tcp::connect((endpoint.host.as_str(), endpoint.port), Json::default);
        connect.config_mut().max_frame_length(MAX_FRAME_LENGTH);
        let transport = connect
            .await
            .map_err(|e| ClientTaskError::Rpc(format!("connection to {} failed: {}", endpoint, e)))?;
        let client = TaskRpcClient::new(client::Config::default(), transport).spawn();

        self.clients
            .lock()
            .await
            .insert(endpoint.clone(), client.clone());
        Ok(client)
    }

    async fn evict(&self, endpoint: &Endpoint) {
        self.clients.lock().await.remove(endpoint);
    }
}

#[async_trait]
impl TaskTransport for RpcTaskTransport {
    async fn call(
        &self,
        endpoint: &Endpoint,
        envelope: TaskEnvelope,
    ) -> Result<TaskPayload, ClientTaskError> {
        let client = self.client(endpoint).await?;
        let mut ctx = context::current();
        ctx.deadline = SystemTime::now() + self.call_timeout;

        match client.run_task(ctx, envelope).await {
            Ok(result) => Ok(result?),
            Err(client::RpcError::DeadlineExceeded) => {
                Err(ClientTaskError::Timeout(self.call_timeout))
            }
            Err(e) => {
                self.evict(endpoint).await;
                Err(ClientTaskError::Rpc(e.to_string()))
            }
        }
    }
}
