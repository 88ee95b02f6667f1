//! Track query endpoints.

use axum::extract::{Path, Query, State};
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use aegis_core::TrackId;
use aegis_store::TrackQuery;

use crate::error::ApiError;

use super::{AppState, CorrelationId, parse_filter, respond};

/// Query parameters for `GET /api/v1/tracks`.
#[derive(Debug, Default, Deserialize)]
pub struct TrackParams {
    /// Filter by classification.
    pub classification: Option<String>,
    /// Filter by threat level.
    pub threat_level: Option<String>,
    /// Filter by platform category (`type`).
    #[serde(rename = "type")]
    pub track_type: Option<String>,
    /// Only tracks updated at or after this instant. Defaults to the
    /// display window (now - 60 s).
    pub since: Option<DateTime<Utc>>,
    /// Page size.
    pub limit: Option<usize>,
    /// Page offset.
    pub offset: Option<usize>,
}

/// Pagination parameters for history listings.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// `GET /api/v1/tracks` -- query active tracks.
#[utoipa::path(
    get,
    path = "/api/v1/tracks",
    tag = "Tracks",
    summary = "Query active tracks",
    params(
        ("classification" = Option<String>, Query, description = "friendly | hostile | neutral | unknown"),
        ("threat_level" = Option<String>, Query, description = "low | medium | high | critical"),
        ("type" = Option<String>, Query, description = "aircraft | vessel | ground | missile | unknown"),
        ("since" = Option<String>, Query, description = "RFC 3339 lower bound on last update (default now-60s)"),
        ("limit" = Option<usize>, Query, description = "Page size"),
        ("offset" = Option<usize>, Query, description = "Page offset"),
    ),
    responses((status = 200, description = "Matching tracks", body = Object))
)]
pub async fn list_tracks(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    Query(params): Query<TrackParams>,
) -> Response {
    let result = async {
        let query = TrackQuery {
            classification: parse_filter("classification", params.classification.as_deref())?,
            threat_level: parse_filter("threat_level", params.threat_level.as_deref())?,
            track_type: parse_filter("type", params.track_type.as_deref())?,
            since: Some(
                params
                    .since
                    .unwrap_or_else(|| Utc::now() - state.display_window),
            ),
            limit: params.limit.unwrap_or(aegis_store::query::DEFAULT_LIMIT),
            offset: params.offset.unwrap_or(0),
        };
        let tracks = state.store.list_tracks(&query).await.map_err(ApiError::from)?;
        Ok(json!({ "count": tracks.len(), "tracks": tracks }))
    }
    .await;
    respond(&correlation_id, result)
}

/// `GET /api/v1/tracks/{id}` -- track detail.
#[utoipa::path(
    get,
    path = "/api/v1/tracks/{id}",
    tag = "Tracks",
    summary = "Track detail",
    params(("id" = String, Path, description = "External track id")),
    responses(
        (status = 200, description = "The track", body = Object),
        (status = 404, description = "Unknown track", body = Object),
    )
)]
pub async fn get_track(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    Path(id): Path<String>,
) -> Response {
    let result = async {
        let track = state
            .store
            .get_track(&TrackId::new(id.clone()))
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::NotFound(format!("track {id}")))?;
        Ok(json!({ "track": track }))
    }
    .await;
    respond(&correlation_id, result)
}

/// `GET /api/v1/tracks/{id}/history` -- paginated detection history.
#[utoipa::path(
    get,
    path = "/api/v1/tracks/{id}/history",
    tag = "Tracks",
    summary = "Track detection history",
    params(
        ("id" = String, Path, description = "External track id"),
        ("limit" = Option<usize>, Query, description = "Page size"),
        ("offset" = Option<usize>, Query, description = "Page offset"),
    ),
    responses((status = 200, description = "Detections, newest first", body = Object))
)]
pub async fn track_history(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    Path(id): Path<String>,
    Query(page): Query<PageParams>,
) -> Response {
    let result = async {
        let history = state
            .store
            .track_history(
                &TrackId::new(id.clone()),
                page.limit.unwrap_or(aegis_store::query::DEFAULT_LIMIT),
                page.offset.unwrap_or(0),
            )
            .await
            .map_err(ApiError::from)?;
        Ok(json!({ "track_id": id, "count": history.len(), "detections": history }))
    }
    .await;
    respond(&correlation_id, result)
}
