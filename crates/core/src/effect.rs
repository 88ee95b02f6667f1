//! Effect records and the idempotent key that makes execution at-most-once.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::proposal::ActionType;
use crate::types::{DecisionId, EffectId, ProposalId, TrackId};

/// Lifecycle of an effect row. `Executed`, `Failed`, and `Simulated` are
/// terminal and write-once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectStatus {
    Pending,
    Executed,
    Failed,
    Simulated,
}

impl EffectStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }

    /// Whether `self -> next` is a legal transition: only out of `pending`.
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        self == Self::Pending && next != Self::Pending
    }
}

impl fmt::Display for EffectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Simulated => "simulated",
        };
        f.write_str(s)
    }
}

/// The audit row written by the effector for each execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectRecord {
    /// Effect identifier.
    pub effect_id: EffectId,
    /// Decision that released this effect.
    pub decision_id: DecisionId,
    /// Proposal behind the decision.
    pub proposal_id: ProposalId,
    /// Track the action targets.
    pub track_id: TrackId,
    /// Action executed.
    pub action_type: ActionType,
    /// Lifecycle state.
    pub status: EffectStatus,
    /// When execution finished (terminal states only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    /// Truncated result or failure description.
    #[serde(default)]
    pub result: String,
    /// Stable dedup key; unique across the effect table.
    pub idempotent_key: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Maximum stored length of an effect result string.
pub const MAX_RESULT_LEN: usize = 500;

/// Truncate a result string for storage.
#[must_use]
pub fn truncate_result(result: &str) -> String {
    if result.len() > MAX_RESULT_LEN {
        let mut end = MAX_RESULT_LEN;
        while !result.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &result[..end])
    } else {
        result.to_owned()
    }
}

/// Derive the idempotent key for a decision: a hex SHA-256 over
/// `(decision_id, action_type, track_id)`. Stable across redeliveries and
/// process restarts.
#[must_use]
pub fn idempotent_key(decision_id: &DecisionId, action_type: ActionType, track_id: &TrackId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(decision_id.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(action_type.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(track_id.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_and_discriminating() {
        let d = DecisionId::new("d1");
        let t = TrackId::new("T1");
        let k1 = idempotent_key(&d, ActionType::Engage, &t);
        let k2 = idempotent_key(&d, ActionType::Engage, &t);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);

        assert_ne!(k1, idempotent_key(&DecisionId::new("d2"), ActionType::Engage, &t));
        assert_ne!(k1, idempotent_key(&d, ActionType::Monitor, &t));
        assert_ne!(k1, idempotent_key(&d, ActionType::Engage, &TrackId::new("T2")));
    }

    #[test]
    fn status_transitions_leave_pending_once() {
        assert!(EffectStatus::Pending.can_transition(EffectStatus::Executed));
        assert!(EffectStatus::Pending.can_transition(EffectStatus::Failed));
        assert!(EffectStatus::Pending.can_transition(EffectStatus::Simulated));
        assert!(!EffectStatus::Executed.can_transition(EffectStatus::Failed));
        assert!(!EffectStatus::Failed.can_transition(EffectStatus::Executed));
        assert!(!EffectStatus::Pending.can_transition(EffectStatus::Pending));
    }

    #[test]
    fn long_results_are_truncated() {
        let long = "r".repeat(600);
        let stored = truncate_result(&long);
        assert!(stored.len() < long.len());
        assert!(stored.ends_with("... (truncated)"));
        assert_eq!(truncate_result("short"), "short");
    }
}
