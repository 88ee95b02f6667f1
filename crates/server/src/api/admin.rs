//! Administrative endpoints.

use axum::extract::State;
use axum::response::Response;
use serde_json::json;
use tracing::warn;

use crate::error::ApiError;

use super::{AppState, CorrelationId, respond};

/// `POST /api/v1/clear` -- truncate the domain tables in foreign-key order
/// and reset counters. Returns per-table deletion counts; clearing twice
/// returns zeros.
#[utoipa::path(
    post,
    path = "/api/v1/clear",
    tag = "Admin",
    summary = "Clear all domain state",
    responses((status = 200, description = "Per-table deletion counts", body = Object))
)]
pub async fn clear(State(state): State<AppState>, correlation_id: CorrelationId) -> Response {
    let result = async {
        let counts = state.store.clear_all().await.map_err(ApiError::from)?;
        warn!(total = counts.total(), "domain state cleared");
        Ok(json!({ "cleared": counts }))
    }
    .await;
    respond(&correlation_id, result)
}
