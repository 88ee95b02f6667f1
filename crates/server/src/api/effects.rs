//! Effect listing.

use axum::extract::{Query, State};
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use aegis_core::TrackId;
use aegis_store::EffectQuery;

use crate::error::ApiError;

use super::{AppState, CorrelationId, parse_filter, respond};

/// Query parameters for `GET /api/v1/effects`.
#[derive(Debug, Default, Deserialize)]
pub struct EffectParams {
    pub status: Option<String>,
    pub track_id: Option<String>,
    pub action_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// `GET /api/v1/effects` -- list effect records.
#[utoipa::path(
    get,
    path = "/api/v1/effects",
    tag = "Effects",
    summary = "List effects",
    params(
        ("status" = Option<String>, Query, description = "pending | executed | failed | simulated"),
        ("track_id" = Option<String>, Query, description = "Filter by track"),
        ("action_type" = Option<String>, Query, description = "Filter by action"),
        ("since" = Option<String>, Query, description = "RFC 3339 lower bound on creation time"),
        ("limit" = Option<usize>, Query, description = "Page size"),
        ("offset" = Option<usize>, Query, description = "Page offset"),
    ),
    responses((status = 200, description = "Matching effects", body = Object))
)]
pub async fn list_effects(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    Query(params): Query<EffectParams>,
) -> Response {
    let result = async {
        let query = EffectQuery {
            status: parse_filter("status", params.status.as_deref())?,
            track_id: params.track_id.map(TrackId::new),
            action_type: parse_filter("action_type", params.action_type.as_deref())?,
            since: params.since,
            limit: params.limit.unwrap_or(aegis_store::query::DEFAULT_LIMIT),
            offset: params.offset.unwrap_or(0),
        };
        let effects = state
            .store
            .list_effects(&query)
            .await
            .map_err(ApiError::from)?;
        Ok(json!({ "count": effects.len(), "effects": effects }))
    }
    .await;
    respond(&correlation_id, result)
}
