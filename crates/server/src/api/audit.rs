//! The flattened decision audit trail.

use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;

use super::{AppState, CorrelationId, respond};

/// Pagination for `GET /api/v1/audit`.
#[derive(Debug, Default, Deserialize)]
pub struct AuditParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// `GET /api/v1/audit` -- proposals joined with their decision and effect.
#[utoipa::path(
    get,
    path = "/api/v1/audit",
    tag = "Audit",
    summary = "Decision audit trail",
    params(
        ("limit" = Option<usize>, Query, description = "Page size"),
        ("offset" = Option<usize>, Query, description = "Page offset"),
    ),
    responses((status = 200, description = "Audit entries, newest proposal first", body = Object))
)]
pub async fn audit_trail(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    Query(params): Query<AuditParams>,
) -> Response {
    let result = async {
        let entries = state
            .store
            .audit_trail(
                params.limit.unwrap_or(aegis_store::query::DEFAULT_LIMIT),
                params.offset.unwrap_or(0),
            )
            .await
            .map_err(ApiError::from)?;
        Ok(json!({ "count": entries.len(), "entries": entries }))
    }
    .await;
    respond(&correlation_id, result)
}
