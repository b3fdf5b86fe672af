//! A read-only HTTP API exposing the session and the registry.

use std::{convert::Infallible, future::Future};

use warp::{
    http::StatusCode,
    reply::{self, Reply},
    Filter,
};

use crate::{registry::RegistryHandle, session::EventSubscriber, settings::ApiSettings};

/// Build the API server.
///
/// Routes:
/// - `GET /status`: the session status
/// - `GET /rounds`: the summaries of all round attempts
/// - `GET /model`: the current global artifact, bincode encoded
/// - `GET /clients`: the known clients in registration order
///
/// The returned future serves until `shutdown` resolves.
///
/// # Errors
/// Fails when the bind address is not available.
pub fn serve(
    api_settings: ApiSettings,
    events: EventSubscriber,
    registry: RegistryHandle,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<impl Future<Output = ()>, warp::Error> {
    let (addr, server) = warp::serve(routes(events, registry))
        .try_bind_with_graceful_shutdown(api_settings.bind_address, shutdown)?;
    info!("REST API listening on {}", addr);
    Ok(server)
}

fn routes(
    events: EventSubscriber,
    registry: RegistryHandle,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let status = warp::path!("status")
        .and(warp::get())
        .and(with_events(events.clone()))
        .map(|events: EventSubscriber| reply::json(&events.status()));

    let rounds = warp::path!("rounds")
        .and(warp::get())
        .and(with_events(events.clone()))
        .map(|events: EventSubscriber| reply::json(events.history().as_ref()));

    let model = warp::path!("model")
        .and(warp::get())
        .and(with_events(events))
        .map(handle_model);

    let clients = warp::path!("clients")
        .and(warp::get())
        .and(warp::any().map(move || registry.clone()))
        .and_then(handle_clients);

    status
        .or(rounds)
        .or(model)
        .or(clients)
        .recover(handle_reject)
        .with(warp::log("http"))
}

fn with_events(
    events: EventSubscriber,
) -> impl Filter<Extract = (EventSubscriber,), Error = Infallible> + Clone {
    warp::any().map(move || events.clone())
}

fn handle_model(events: EventSubscriber) -> reply::Response {
    match events.model().to_bytes() {
        Ok(bytes) => {
            reply::with_header(bytes, "Content-Type", "application/octet-stream").into_response()
        }
        Err(e) => {
            warn!("failed to serialize the global model: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_clients(registry: RegistryHandle) -> Result<reply::Response, Infallible> {
    Ok(match registry.snapshot().await {
        Ok(clients) => reply::json(&clients).into_response(),
        Err(e) => {
            warn!("failed to handle clients request: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    })
}

async fn handle_reject(err: warp::Rejection) -> Result<reply::Response, Infallible> {
    let code = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        error!("unhandled rejection: {:?}", err);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok(reply::with_status(reply::reply(), code).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::{Capabilities, ClientId, Endpoint, GlobalArtifact},
        registry::RegistryService,
        session::{EventPublisher, SessionState, SessionStatus},
    };
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn test_routes() {
        let (service, registry) = RegistryService::new(Duration::from_secs(30));
        tokio::spawn(service.run());
        registry
            .register(ClientId::new(), Endpoint::new("h", 1), Capabilities::default())
            .await
            .unwrap();

        let status = SessionStatus {
            state: SessionState::Created,
            current_round: None,
            rounds_completed: 0,
            total_rounds: 2,
            model_version: None,
            reason: None,
        };
        let artifact = Arc::new(GlobalArtifact::initial(vec![1.0, 2.0]));
        let (_publisher, events) = EventPublisher::init(status, artifact.clone());
        let api = routes(events, registry);

        let res = warp::test::request().path("/status").reply(&api).await;
        assert_eq!(res.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["state"], "CREATED");

        let res = warp::test::request().path("/model").reply(&api).await;
        assert_eq!(res.status(), 200);
        assert_eq!(
            GlobalArtifact::from_bytes(res.body()).unwrap(),
            *artifact
        );

        let res = warp::test::request().path("/clients").reply(&api).await;
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 1);

        let res = warp::test::request().path("/rounds").reply(&api).await;
        assert_eq!(&res.body()[..], b"[]");

        let res = warp::test::request().path("/nope").reply(&api).await;
        assert_eq!(res.status(), 404);
    }
}
