//! Proposal endpoints, including the human decision that unblocks the
//! effector.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use aegis_core::{
    BusMessage, Decision, DecisionId, Envelope, ProposalId, ProposalStatus, Subject, TrackId,
};
use aegis_store::ProposalQuery;

use crate::error::ApiError;
use crate::ws::Frame;

use super::{AppState, CorrelationId, parse_filter, respond, respond_with_status};

/// Query parameters for `GET /api/v1/proposals`.
#[derive(Debug, Default, Deserialize)]
pub struct ProposalParams {
    pub status: Option<String>,
    pub track_id: Option<String>,
    pub action_type: Option<String>,
    pub threat_level: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Body of `POST /api/v1/proposals/{id}/decide`.
#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    /// Approve (`true`) or deny (`false`).
    pub approved: bool,
    /// Deciding operator; must be non-empty and non-system.
    pub approved_by: String,
    /// Justification.
    #[serde(default)]
    pub reason: String,
    /// Conditions attached to an approval.
    #[serde(default)]
    pub conditions: Vec<String>,
}

/// `GET /api/v1/proposals` -- list proposals.
#[utoipa::path(
    get,
    path = "/api/v1/proposals",
    tag = "Proposals",
    summary = "List proposals",
    params(
        ("status" = Option<String>, Query, description = "pending | approved | denied | expired"),
        ("track_id" = Option<String>, Query, description = "Filter by track"),
        ("action_type" = Option<String>, Query, description = "engage | intercept | identify | track | monitor | ignore"),
        ("threat_level" = Option<String>, Query, description = "low | medium | high | critical"),
        ("limit" = Option<usize>, Query, description = "Page size"),
        ("offset" = Option<usize>, Query, description = "Page offset"),
    ),
    responses((status = 200, description = "Matching proposals", body = Object))
)]
pub async fn list_proposals(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    Query(params): Query<ProposalParams>,
) -> Response {
    let result = async {
        let query = ProposalQuery {
            status: parse_filter("status", params.status.as_deref())?,
            track_id: params.track_id.map(TrackId::new),
            action_type: parse_filter("action_type", params.action_type.as_deref())?,
            threat_level: parse_filter("threat_level", params.threat_level.as_deref())?,
            limit: params.limit.unwrap_or(aegis_store::query::DEFAULT_LIMIT),
            offset: params.offset.unwrap_or(0),
        };
        let proposals = state
            .store
            .list_proposals(&query)
            .await
            .map_err(ApiError::from)?;
        Ok(json!({ "count": proposals.len(), "proposals": proposals }))
    }
    .await;
    respond(&correlation_id, result)
}

/// `GET /api/v1/proposals/{id}` -- proposal detail.
#[utoipa::path(
    get,
    path = "/api/v1/proposals/{id}",
    tag = "Proposals",
    summary = "Proposal detail",
    params(("id" = String, Path, description = "Proposal id")),
    responses(
        (status = 200, description = "The proposal", body = Object),
        (status = 404, description = "Unknown proposal", body = Object),
    )
)]
pub async fn get_proposal(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    Path(id): Path<String>,
) -> Response {
    let result = async {
        let proposal = state
            .store
            .get_proposal(&ProposalId::new(id.clone()))
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::NotFound(format!("proposal {id}")))?;
        Ok(json!({ "proposal": proposal }))
    }
    .await;
    respond(&correlation_id, result)
}

/// `POST /api/v1/proposals/{id}/decide` -- the human decision.
///
/// `404` for an unknown proposal, `409` when it is no longer pending or
/// has expired, `422` for approvals the domain forbids (policy-denied
/// proposals, bad approver). On success the decision is persisted, the
/// proposal flips, and `decision.{approved|denied}.<action_type>` is
/// published for the effector and push clients.
#[utoipa::path(
    post,
    path = "/api/v1/proposals/{id}/decide",
    tag = "Proposals",
    summary = "Decide a pending proposal",
    params(("id" = String, Path, description = "Proposal id")),
    request_body = Object,
    responses(
        (status = 201, description = "Decision recorded", body = Object),
        (status = 404, description = "Unknown proposal", body = Object),
        (status = 409, description = "Not pending or expired", body = Object),
        (status = 422, description = "Approval forbidden", body = Object),
    )
)]
pub async fn decide(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    Path(id): Path<String>,
    body: Result<axum::Json<DecideRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let result = async {
        let axum::Json(request) =
            body.map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))?;
        let proposal_id = ProposalId::new(id.clone());

        let proposal = state
            .store
            .get_proposal(&proposal_id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::NotFound(format!("proposal {id}")))?;

        if proposal.status != ProposalStatus::Pending {
            return Err(ApiError::Conflict(format!(
                "proposal {id} is already {}",
                proposal.status
            )));
        }
        if proposal.is_expired(Utc::now()) {
            return Err(ApiError::Conflict(format!("proposal {id} has expired")));
        }
        if request.approved && !proposal.policy_decision.allowed {
            return Err(ApiError::Validation(format!(
                "proposal {id} was denied by policy: {}",
                proposal.policy_decision.reasons.join("; ")
            )));
        }

        let decision = Decision {
            decision_id: DecisionId::new_random(),
            proposal_id: proposal.proposal_id.clone(),
            track_id: proposal.track_id.clone(),
            action_type: proposal.action_type,
            approved: request.approved,
            approved_by: request.approved_by,
            approved_at: Utc::now(),
            reason: request.reason,
            conditions: request.conditions,
        };
        decision
            .validate()
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        // Operators are people; system identities may only decide through
        // the authorizer's rule path.
        if decision.is_system() {
            return Err(ApiError::Validation(
                "approved_by must not be a system identity".to_owned(),
            ));
        }

        state
            .store
            .insert_decision(&decision)
            .await
            .map_err(ApiError::from)?;
        let status = if decision.approved {
            ProposalStatus::Approved
        } else {
            ProposalStatus::Denied
        };
        state
            .store
            .transition_proposal(&proposal_id, status)
            .await
            .map_err(ApiError::from)?;

        let subject = Subject::decision(decision.approved, decision.action_type);
        let envelope = Envelope::root("api", "api");
        let message = BusMessage::new(envelope, decision.clone());
        state
            .bus
            .publish(
                &subject,
                message
                    .to_bytes()
                    .map_err(|e| ApiError::Internal(e.to_string()))?,
            )
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        if let Ok(payload) = serde_json::to_value(&decision) {
            state.hub.broadcast(Frame::new(
                "decision.made",
                payload,
                Some(message.envelope.correlation_id.clone()),
            ));
        }

        info!(
            proposal_id = %id,
            approved = decision.approved,
            approved_by = %decision.approved_by,
            "human decision recorded"
        );
        Ok(json!({ "decision": decision }))
    }
    .await;
    respond_with_status(StatusCode::CREATED, &correlation_id, result)
}
