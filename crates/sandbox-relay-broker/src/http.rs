//! HTTP surface for the broker.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::post,
};
use sandbox_relay_bus::MessageBus;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::broker::{BrokerError, SessionBroker, StartRequest};
use crate::driver::SandboxDriver;
use crate::verify::IdentityVerifier;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Sandbox(_) | Self::Bus(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Build the broker router.
///
/// Routes:
/// - `POST /v1/sessions` - start (or restart) a session
/// - `POST /v1/sessions/{id}/keepalive` - reset the idle-sleep timer
/// - `POST /v1/sessions/{id}/stop` - tear a session down
#[must_use]
pub fn router<V, D, B>(broker: Arc<SessionBroker<V, D, B>>) -> Router
where
    V: IdentityVerifier + 'static,
    D: SandboxDriver + 'static,
    B: MessageBus + 'static,
{
    Router::new()
        .route("/v1/sessions", post(start::<V, D, B>))
        .route("/v1/sessions/{id}/keepalive", post(keepalive::<V, D, B>))
        .route("/v1/sessions/{id}/stop", post(stop::<V, D, B>))
        .layer(CorsLayer::permissive())
        .with_state(broker)
}

async fn start<V, D, B>(
    State(broker): State<Arc<SessionBroker<V, D, B>>>,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> Response
where
    V: IdentityVerifier + 'static,
    D: SandboxDriver + 'static,
    B: MessageBus + 'static,
{
    match broker.start_session(request, bearer(&headers)).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn keepalive<V, D, B>(
    State(broker): State<Arc<SessionBroker<V, D, B>>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response
where
    V: IdentityVerifier + 'static,
    D: SandboxDriver + 'static,
    B: MessageBus + 'static,
{
    match broker.keepalive(&session_id, bearer(&headers)).await {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn stop<V, D, B>(
    State(broker): State<Arc<SessionBroker<V, D, B>>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response
where
    V: IdentityVerifier + 'static,
    D: SandboxDriver + 'static,
    B: MessageBus + 'static,
{
    match broker.stop_session(&session_id, bearer(&headers)).await {
        Ok(()) => Json(serde_json::json!({ "status": "stopped" })).into_response(),
        Err(e) => e.into_response(),
    }
}
