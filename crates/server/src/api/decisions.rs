//! Decision listing.

use axum::extract::{Query, State};
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use aegis_core::TrackId;
use aegis_store::DecisionQuery;

use crate::error::ApiError;

use super::{AppState, CorrelationId, parse_filter, respond};

/// Query parameters for `GET /api/v1/decisions`.
#[derive(Debug, Default, Deserialize)]
pub struct DecisionParams {
    pub approved: Option<bool>,
    pub track_id: Option<String>,
    pub action_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// `GET /api/v1/decisions` -- list decisions.
#[utoipa::path(
    get,
    path = "/api/v1/decisions",
    tag = "Decisions",
    summary = "List decisions",
    params(
        ("approved" = Option<bool>, Query, description = "Filter by verdict"),
        ("track_id" = Option<String>, Query, description = "Filter by track"),
        ("action_type" = Option<String>, Query, description = "Filter by action"),
        ("since" = Option<String>, Query, description = "RFC 3339 lower bound on decision time"),
        ("limit" = Option<usize>, Query, description = "Page size"),
        ("offset" = Option<usize>, Query, description = "Page offset"),
    ),
    responses((status = 200, description = "Matching decisions", body = Object))
)]
pub async fn list_decisions(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    Query(params): Query<DecisionParams>,
) -> Response {
    let result = async {
        let query = DecisionQuery {
            approved: params.approved,
            track_id: params.track_id.map(TrackId::new),
            action_type: parse_filter("action_type", params.action_type.as_deref())?,
            since: params.since,
            limit: params.limit.unwrap_or(aegis_store::query::DEFAULT_LIMIT),
            offset: params.offset.unwrap_or(0),
        };
        let decisions = state
            .store
            .list_decisions(&query)
            .await
            .map_err(ApiError::from)?;
        Ok(json!({ "count": decisions.len(), "decisions": decisions }))
    }
    .await;
    respond(&correlation_id, result)
}
