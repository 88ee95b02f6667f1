//! The HTTP surface.
//!
//! Every response is JSON and carries the request's `correlation_id`
//! (taken from the `X-Correlation-Id` header or freshly minted). Errors
//! use the typed envelope `{error, message, correlation_id}`.

pub mod admin;
pub mod audit;
pub mod decisions;
pub mod effects;
pub mod metrics;
pub mod openapi;
pub mod proposals;
pub mod rules;
pub mod tracks;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{FromRequestParts, State, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use serde::de::DeserializeOwned;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use aegis_agent::AgentMetrics;
use aegis_bus::MessageBus;
use aegis_policy::PolicyClient;
use aegis_store::CanonicalStore;

use crate::error::ApiError;
use crate::ws::HubHandle;

use self::openapi::ApiDoc;

/// Shared application state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The canonical store of record.
    pub store: Arc<dyn CanonicalStore>,
    /// The message bus (used by the decide endpoint to publish decisions).
    pub bus: Arc<dyn MessageBus>,
    /// Optional policy engine client, reported in `/health`.
    pub policy: Option<PolicyClient>,
    /// The push hub.
    pub hub: HubHandle,
    /// Per-agent metrics registries, keyed by stage name.
    pub agent_metrics: Arc<HashMap<&'static str, Arc<AgentMetrics>>>,
    /// Default lookback for "active" track queries.
    pub display_window: chrono::Duration,
}

/// Correlation id of the request: the `X-Correlation-Id` header when
/// present, a fresh UUIDv7 otherwise.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for CorrelationId {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-correlation-id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map_or_else(|| Uuid::now_v7().to_string(), str::to_owned);
        Ok(Self(id))
    }
}

/// Wrap a handler result: inject `correlation_id` into the success object
/// or render the error envelope.
pub(crate) fn respond(
    correlation_id: &CorrelationId,
    result: Result<serde_json::Value, ApiError>,
) -> Response {
    match result {
        Ok(mut body) => {
            if let Some(object) = body.as_object_mut() {
                object.insert(
                    "correlation_id".to_owned(),
                    serde_json::Value::String(correlation_id.0.clone()),
                );
            }
            axum::Json(body).into_response()
        }
        Err(e) => e.into_response_with(&correlation_id.0),
    }
}

/// Like [`respond`] but with an explicit success status (e.g. `201`).
pub(crate) fn respond_with_status(
    status: axum::http::StatusCode,
    correlation_id: &CorrelationId,
    result: Result<serde_json::Value, ApiError>,
) -> Response {
    match result {
        Ok(mut body) => {
            if let Some(object) = body.as_object_mut() {
                object.insert(
                    "correlation_id".to_owned(),
                    serde_json::Value::String(correlation_id.0.clone()),
                );
            }
            (status, axum::Json(body)).into_response()
        }
        Err(e) => e.into_response_with(&correlation_id.0),
    }
}

/// Parse an optional lowercase enum token from a query string.
pub(crate) fn parse_filter<T: DeserializeOwned>(
    name: &str,
    value: Option<&str>,
) -> Result<Option<T>, ApiError> {
    value
        .map(|token| {
            serde_json::from_value(serde_json::Value::String(token.to_owned()))
                .map_err(|_| ApiError::BadRequest(format!("invalid {name}: {token}")))
        })
        .transpose()
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| crate::ws::handle_socket(hub, socket))
}

/// Build the Axum router with all API routes, middleware, and Swagger UI.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/tracks", get(tracks::list_tracks))
        .route("/api/v1/tracks/{id}", get(tracks::get_track))
        .route("/api/v1/tracks/{id}/history", get(tracks::track_history))
        .route("/api/v1/proposals", get(proposals::list_proposals))
        .route("/api/v1/proposals/{id}", get(proposals::get_proposal))
        .route("/api/v1/proposals/{id}/decide", post(proposals::decide))
        .route("/api/v1/decisions", get(decisions::list_decisions))
        .route("/api/v1/effects", get(effects::list_effects))
        .route("/api/v1/audit", get(audit::audit_trail))
        .route("/api/v1/intervention-rules", get(rules::list_rules))
        .route("/api/v1/intervention-rules", post(rules::create_rule))
        .route("/api/v1/intervention-rules/{id}", get(rules::get_rule))
        .route("/api/v1/intervention-rules/{id}", put(rules::update_rule))
        .route("/api/v1/intervention-rules/{id}", delete(rules::delete_rule))
        .route("/api/v1/clear", post(admin::clear))
        .route("/api/v1/metrics", get(metrics::pipeline_metrics))
        .route("/api/v1/metrics/stages", get(metrics::stage_metrics))
        .route("/api/v1/metrics/agents", get(metrics::agent_metrics))
        .route("/health", get(metrics::health))
        .route("/metrics", get(metrics::prometheus))
        .route("/ws", get(ws_upgrade));

    api.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
