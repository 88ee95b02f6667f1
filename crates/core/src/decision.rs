use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::proposal::ActionType;
use crate::types::{DecisionId, ProposalId, TrackId};

/// A terminal verdict on a proposal, recorded by a human operator or by the
/// authorizer on behalf of an intervention rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Decision identifier.
    pub decision_id: DecisionId,
    /// Proposal this decision terminates.
    pub proposal_id: ProposalId,
    /// Track the proposal targets.
    pub track_id: TrackId,
    /// Action that was proposed.
    pub action_type: ActionType,
    /// Whether the proposal was approved.
    pub approved: bool,
    /// Deciding principal. Human operators use their own id; rule-driven
    /// decisions use `system-<rule_id>` and the expiry sweeper uses
    /// `system-expired`.
    pub approved_by: String,
    /// When the decision was made.
    pub approved_at: DateTime<Utc>,
    /// Free-text justification.
    #[serde(default)]
    pub reason: String,
    /// Conditions attached by the approver.
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl Decision {
    /// Validate the approver invariant: `approved_by` must be non-empty, and
    /// for human-required actions an approval may not come from a
    /// `system-*` principal.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.approved_by.is_empty() {
            return Err(PipelineError::Validation(
                "approved_by must not be empty".to_owned(),
            ));
        }
        if self.approved && self.action_type.requires_human() && self.is_system() {
            return Err(PipelineError::Validation(format!(
                "action {} requires a human approver, got {}",
                self.action_type, self.approved_by
            )));
        }
        Ok(())
    }

    /// Whether the deciding principal is a system identity.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.approved_by.starts_with("system-") || self.approved_by == "system"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(action: ActionType, approved: bool, by: &str) -> Decision {
        Decision {
            decision_id: DecisionId::new_random(),
            proposal_id: ProposalId::new_random(),
            track_id: TrackId::new("T1"),
            action_type: action,
            approved,
            approved_by: by.to_owned(),
            approved_at: Utc::now(),
            reason: "cleared".into(),
            conditions: vec![],
        }
    }

    #[test]
    fn empty_approver_is_rejected() {
        assert!(decision(ActionType::Monitor, true, "").validate().is_err());
    }

    #[test]
    fn system_may_approve_monitor_but_not_engage() {
        assert!(decision(ActionType::Monitor, true, "system-rule-1").validate().is_ok());
        assert!(decision(ActionType::Engage, true, "system-rule-1").validate().is_err());
        assert!(decision(ActionType::Engage, true, "op1").validate().is_ok());
    }

    #[test]
    fn system_denial_of_engage_is_fine() {
        // The expiry sweeper denies human-required actions as system-expired.
        assert!(decision(ActionType::Engage, false, "system-expired").validate().is_ok());
    }
}
