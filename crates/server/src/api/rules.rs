//! Intervention rule management.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use aegis_core::{InterventionRule, RuleId, RuleVerdict};

use crate::error::ApiError;

use super::{AppState, CorrelationId, respond, respond_with_status};

/// Body of rule create/update requests.
#[derive(Debug, Deserialize)]
pub struct RuleRequest {
    /// Unique rule name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Action types matched; empty matches all.
    #[serde(default)]
    pub action_types: Vec<aegis_core::ActionType>,
    /// Threat levels matched; empty matches all.
    #[serde(default)]
    pub threat_levels: Vec<aegis_core::ThreatLevel>,
    /// Classifications matched; empty matches all.
    #[serde(default)]
    pub classifications: Vec<aegis_core::Classification>,
    /// Track types matched; empty matches all.
    #[serde(default)]
    pub track_types: Vec<aegis_core::TrackType>,
    /// Inclusive lower priority bound.
    #[serde(default = "default_min_priority")]
    pub min_priority: u8,
    /// Inclusive upper priority bound.
    #[serde(default = "default_max_priority")]
    pub max_priority: u8,
    /// Verdict when the rule matches.
    pub verdict: RuleVerdict,
    /// Evaluation position; lower runs first.
    #[serde(default)]
    pub evaluation_order: i32,
    /// Disabled rules are skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_min_priority() -> u8 {
    1
}
fn default_max_priority() -> u8 {
    10
}
fn default_enabled() -> bool {
    true
}

impl RuleRequest {
    fn into_rule(self, rule_id: RuleId) -> Result<InterventionRule, ApiError> {
        let rule = InterventionRule {
            rule_id,
            name: self.name,
            description: self.description,
            action_types: self.action_types,
            threat_levels: self.threat_levels,
            classifications: self.classifications,
            track_types: self.track_types,
            min_priority: self.min_priority,
            max_priority: self.max_priority,
            verdict: self.verdict,
            evaluation_order: self.evaluation_order,
            enabled: self.enabled,
            created_at: Utc::now(),
        };
        rule.validate()
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        Ok(rule)
    }
}

/// `GET /api/v1/intervention-rules` -- list rules by evaluation order.
#[utoipa::path(
    get,
    path = "/api/v1/intervention-rules",
    tag = "Rules",
    summary = "List intervention rules",
    responses((status = 200, description = "Rules ordered by evaluation_order", body = Object))
)]
pub async fn list_rules(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
) -> Response {
    let result = async {
        let rules = state.store.list_rules().await.map_err(ApiError::from)?;
        Ok(json!({ "count": rules.len(), "rules": rules }))
    }
    .await;
    respond(&correlation_id, result)
}

/// `POST /api/v1/intervention-rules` -- create a rule.
#[utoipa::path(
    post,
    path = "/api/v1/intervention-rules",
    tag = "Rules",
    summary = "Create an intervention rule",
    request_body = Object,
    responses(
        (status = 201, description = "Rule created", body = Object),
        (status = 409, description = "Duplicate rule name", body = Object),
        (status = 422, description = "Invalid rule", body = Object),
    )
)]
pub async fn create_rule(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    body: Result<axum::Json<RuleRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let result = async {
        let axum::Json(request) =
            body.map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))?;
        let rule = request.into_rule(RuleId::new_random())?;
        state.store.insert_rule(&rule).await.map_err(ApiError::from)?;
        info!(rule = %rule.name, "intervention rule created");
        Ok(json!({ "rule": rule }))
    }
    .await;
    respond_with_status(StatusCode::CREATED, &correlation_id, result)
}

/// `GET /api/v1/intervention-rules/{id}` -- rule detail.
#[utoipa::path(
    get,
    path = "/api/v1/intervention-rules/{id}",
    tag = "Rules",
    summary = "Rule detail",
    params(("id" = String, Path, description = "Rule id")),
    responses(
        (status = 200, description = "The rule", body = Object),
        (status = 404, description = "Unknown rule", body = Object),
    )
)]
pub async fn get_rule(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    Path(id): Path<String>,
) -> Response {
    let result = async {
        let rule = state
            .store
            .get_rule(&RuleId::new(id.clone()))
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::NotFound(format!("rule {id}")))?;
        Ok(json!({ "rule": rule }))
    }
    .await;
    respond(&correlation_id, result)
}

/// `PUT /api/v1/intervention-rules/{id}` -- replace a rule.
#[utoipa::path(
    put,
    path = "/api/v1/intervention-rules/{id}",
    tag = "Rules",
    summary = "Update an intervention rule",
    params(("id" = String, Path, description = "Rule id")),
    request_body = Object,
    responses(
        (status = 200, description = "Rule updated", body = Object),
        (status = 404, description = "Unknown rule", body = Object),
        (status = 409, description = "Duplicate rule name", body = Object),
        (status = 422, description = "Invalid rule", body = Object),
    )
)]
pub async fn update_rule(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    Path(id): Path<String>,
    body: Result<axum::Json<RuleRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let result = async {
        let axum::Json(request) =
            body.map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))?;
        let rule = request.into_rule(RuleId::new(id))?;
        state.store.update_rule(&rule).await.map_err(ApiError::from)?;
        Ok(json!({ "rule": rule }))
    }
    .await;
    respond(&correlation_id, result)
}

/// `DELETE /api/v1/intervention-rules/{id}` -- remove a rule.
#[utoipa::path(
    delete,
    path = "/api/v1/intervention-rules/{id}",
    tag = "Rules",
    summary = "Delete an intervention rule",
    params(("id" = String, Path, description = "Rule id")),
    responses(
        (status = 200, description = "Rule deleted", body = Object),
        (status = 404, description = "Unknown rule", body = Object),
    )
)]
pub async fn delete_rule(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    Path(id): Path<String>,
) -> Response {
    let result = async {
        let deleted = state
            .store
            .delete_rule(&RuleId::new(id.clone()))
            .await
            .map_err(ApiError::from)?;
        if !deleted {
            return Err(ApiError::NotFound(format!("rule {id}")));
        }
        Ok(json!({ "deleted": id }))
    }
    .await;
    respond(&correlation_id, result)
}
