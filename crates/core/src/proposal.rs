//! Action proposals and the planner's decisioning helpers.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::track::{Classification, ThreatLevel};
use crate::types::{ProposalId, TrackId};

/// Minimum length of a proposal rationale.
pub const MIN_RATIONALE_LEN: usize = 10;

/// The action a proposal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Engage,
    Intercept,
    Identify,
    Track,
    Monitor,
    Ignore,
}

impl ActionType {
    /// Actions that must never be auto-approved by a `system-*` principal.
    /// Intervention rules can require approval for more, never for less.
    #[must_use]
    pub fn requires_human(self) -> bool {
        matches!(self, Self::Engage | Self::Intercept)
    }

    /// Parse the lowercase wire token.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "engage" => Some(Self::Engage),
            "intercept" => Some(Self::Intercept),
            "identify" => Some(Self::Identify),
            "track" => Some(Self::Track),
            "monitor" => Some(Self::Monitor),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Engage => "engage",
            Self::Intercept => "intercept",
            Self::Identify => "identify",
            Self::Track => "track",
            Self::Monitor => "monitor",
            Self::Ignore => "ignore",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a proposal. `Pending` terminates in exactly one of the
/// other states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ProposalStatus {
    /// Whether `self -> next` is a legal transition. Only
    /// `pending -> {approved, denied, expired}` is permitted; terminal
    /// states never change.
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        self == Self::Pending && next != Self::Pending
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Outcome of a policy evaluation, recorded on the proposal for audit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyVerdict {
    /// Whether the policy allowed the proposal.
    pub allowed: bool,
    /// Reasons given for a denial.
    #[serde(default)]
    pub reasons: Vec<String>,
    /// Non-blocking warnings (e.g. engine unreachable, version skew).
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// An action proposal produced by the planner and adjudicated by the
/// authorizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionProposal {
    /// Proposal identifier.
    pub proposal_id: ProposalId,
    /// Track the action targets.
    pub track_id: TrackId,
    /// Requested action.
    pub action_type: ActionType,
    /// Urgency in `[1, 10]`.
    pub priority: u8,
    /// Human-readable justification, at least [`MIN_RATIONALE_LEN`] chars.
    pub rationale: String,
    /// Operational constraints the effect must honor.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Classification of the track at proposal time.
    pub classification: Classification,
    /// Threat level of the track at proposal time.
    pub threat_level: ThreatLevel,
    /// Platform category of the track at proposal time.
    pub track_type: crate::track::TrackType,
    /// Lifecycle state.
    pub status: ProposalStatus,
    /// Hard deadline after which the proposal expires undecided.
    pub expires_at: DateTime<Utc>,
    /// Policy evaluation recorded at generation time.
    #[serde(default)]
    pub policy_decision: PolicyVerdict,
    /// Number of duplicate proposals folded into this row.
    #[serde(default)]
    pub hit_count: u64,
    /// When the latest duplicate arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_hit_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ActionProposal {
    /// Validate the hard proposal invariants: priority in `[1, 10]` and a
    /// rationale of at least [`MIN_RATIONALE_LEN`] characters.
    pub fn validate(&self) -> Result<(), crate::error::PipelineError> {
        if !(1..=10).contains(&self.priority) {
            return Err(crate::error::PipelineError::Validation(format!(
                "priority {} out of range [1, 10]",
                self.priority
            )));
        }
        if self.rationale.chars().count() < MIN_RATIONALE_LEN {
            return Err(crate::error::PipelineError::Validation(format!(
                "rationale must be at least {MIN_RATIONALE_LEN} characters"
            )));
        }
        Ok(())
    }

    /// Whether the proposal has passed its deadline at `now`. A proposal is
    /// already expired at exactly `expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Subject bucket for a proposal priority: `high` at 8 and above, `medium`
/// at 5 and above, otherwise `normal`.
#[must_use]
pub fn priority_bucket(priority: u8) -> &'static str {
    if priority >= 8 {
        "high"
    } else if priority >= 5 {
        "medium"
    } else {
        "normal"
    }
}

/// The planner's decision table: preferred action and priority for a
/// (classification, threat) pair.
#[must_use]
pub fn plan_action(
    classification: Classification,
    track_type: crate::track::TrackType,
    threat: ThreatLevel,
) -> (ActionType, u8) {
    use crate::track::TrackType;
    match (classification, threat) {
        (Classification::Hostile, ThreatLevel::Critical) if track_type == TrackType::Missile => {
            (ActionType::Engage, 10)
        }
        (Classification::Hostile, ThreatLevel::Critical) => (ActionType::Intercept, 9),
        (Classification::Hostile, ThreatLevel::High) => (ActionType::Intercept, 8),
        (Classification::Unknown, ThreatLevel::High) => (ActionType::Identify, 7),
        (Classification::Hostile, ThreatLevel::Medium) => (ActionType::Track, 6),
        (Classification::Unknown, ThreatLevel::Medium) => (ActionType::Identify, 5),
        (Classification::Neutral, ThreatLevel::Low) => (ActionType::Monitor, 3),
        (Classification::Friendly, ThreatLevel::Low) => (ActionType::Monitor, 2),
        _ => (ActionType::Track, 4),
    }
}

/// Constraints appended per action and classification.
#[must_use]
pub fn constraints_for(action: ActionType, classification: Classification) -> Vec<String> {
    let mut constraints = Vec::new();
    match action {
        ActionType::Engage => {
            constraints.push("positive identification required".to_owned());
            constraints.push("rules of engagement compliance".to_owned());
            constraints.push("commander approval required".to_owned());
            constraints.push("collateral damage assessment".to_owned());
        }
        ActionType::Intercept => {
            constraints.push("maintain safe separation".to_owned());
            constraints.push("rules of engagement compliance".to_owned());
        }
        ActionType::Identify => {
            constraints.push("visual or electronic identification".to_owned());
        }
        ActionType::Track | ActionType::Monitor | ActionType::Ignore => {}
    }
    if classification == Classification::Friendly {
        constraints.push("IFF verification".to_owned());
    }
    constraints
}

/// Priority-dependent proposal lifetime: 1 minute at priority >= 9, 2 at
/// >= 7, 5 at >= 5, else 15.
#[must_use]
pub fn expiry_for(priority: u8, now: DateTime<Utc>) -> DateTime<Utc> {
    let minutes = if priority >= 9 {
        1
    } else if priority >= 7 {
        2
    } else if priority >= 5 {
        5
    } else {
        15
    };
    now + Duration::minutes(minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::TrackType;

    fn proposal(priority: u8, rationale: &str) -> ActionProposal {
        let now = Utc::now();
        ActionProposal {
            proposal_id: ProposalId::new_random(),
            track_id: TrackId::new("T1"),
            action_type: ActionType::Track,
            priority,
            rationale: rationale.to_owned(),
            constraints: vec![],
            classification: Classification::Unknown,
            threat_level: ThreatLevel::Medium,
            track_type: TrackType::Aircraft,
            status: ProposalStatus::Pending,
            expires_at: expiry_for(priority, now),
            policy_decision: PolicyVerdict::default(),
            hit_count: 0,
            last_hit_at: None,
            created_at: now,
        }
    }

    #[test]
    fn validation_enforces_priority_and_rationale() {
        assert!(proposal(5, "monitoring unknown contact").validate().is_ok());
        assert!(proposal(0, "monitoring unknown contact").validate().is_err());
        assert!(proposal(11, "monitoring unknown contact").validate().is_err());
        assert!(proposal(5, "too short").validate().is_err());
    }

    #[test]
    fn status_machine_only_leaves_pending() {
        assert!(ProposalStatus::Pending.can_transition(ProposalStatus::Approved));
        assert!(ProposalStatus::Pending.can_transition(ProposalStatus::Denied));
        assert!(ProposalStatus::Pending.can_transition(ProposalStatus::Expired));
        assert!(!ProposalStatus::Pending.can_transition(ProposalStatus::Pending));
        assert!(!ProposalStatus::Approved.can_transition(ProposalStatus::Denied));
        assert!(!ProposalStatus::Expired.can_transition(ProposalStatus::Approved));
    }

    #[test]
    fn decision_table() {
        assert_eq!(
            plan_action(Classification::Hostile, TrackType::Missile, ThreatLevel::Critical),
            (ActionType::Engage, 10)
        );
        assert_eq!(
            plan_action(Classification::Hostile, TrackType::Aircraft, ThreatLevel::Critical),
            (ActionType::Intercept, 9)
        );
        assert_eq!(
            plan_action(Classification::Hostile, TrackType::Aircraft, ThreatLevel::High),
            (ActionType::Intercept, 8)
        );
        assert_eq!(
            plan_action(Classification::Unknown, TrackType::Aircraft, ThreatLevel::High),
            (ActionType::Identify, 7)
        );
        assert_eq!(
            plan_action(Classification::Hostile, TrackType::Vessel, ThreatLevel::Medium),
            (ActionType::Track, 6)
        );
        assert_eq!(
            plan_action(Classification::Unknown, TrackType::Vessel, ThreatLevel::Medium),
            (ActionType::Identify, 5)
        );
        assert_eq!(
            plan_action(Classification::Neutral, TrackType::Vessel, ThreatLevel::Low),
            (ActionType::Monitor, 3)
        );
        assert_eq!(
            plan_action(Classification::Friendly, TrackType::Aircraft, ThreatLevel::Low),
            (ActionType::Monitor, 2)
        );
        assert_eq!(
            plan_action(Classification::Unknown, TrackType::Unknown, ThreatLevel::Low),
            (ActionType::Track, 4)
        );
    }

    #[test]
    fn engage_carries_the_full_constraint_set() {
        let c = constraints_for(ActionType::Engage, Classification::Hostile);
        assert_eq!(c.len(), 4);
        assert!(c.iter().any(|s| s.contains("positive identification")));
        assert!(c.iter().any(|s| s.contains("commander approval")));
    }

    #[test]
    fn friendly_always_gets_iff_verification() {
        let c = constraints_for(ActionType::Monitor, Classification::Friendly);
        assert_eq!(c, vec!["IFF verification".to_owned()]);
    }

    #[test]
    fn expiry_ladder() {
        let now = Utc::now();
        assert_eq!(expiry_for(10, now), now + Duration::minutes(1));
        assert_eq!(expiry_for(9, now), now + Duration::minutes(1));
        assert_eq!(expiry_for(7, now), now + Duration::minutes(2));
        assert_eq!(expiry_for(5, now), now + Duration::minutes(5));
        assert_eq!(expiry_for(4, now), now + Duration::minutes(15));
    }

    #[test]
    fn expired_exactly_at_deadline() {
        let p = proposal(5, "monitoring unknown contact");
        assert!(p.is_expired(p.expires_at));
        assert!(!p.is_expired(p.expires_at - Duration::seconds(1)));
    }

    #[test]
    fn human_required_actions() {
        assert!(ActionType::Engage.requires_human());
        assert!(ActionType::Intercept.requires_human());
        assert!(!ActionType::Monitor.requires_human());
        assert!(!ActionType::Track.requires_human());
    }

    #[test]
    fn action_type_parse_roundtrip() {
        for a in [
            ActionType::Engage,
            ActionType::Intercept,
            ActionType::Identify,
            ActionType::Track,
            ActionType::Monitor,
            ActionType::Ignore,
        ] {
            assert_eq!(ActionType::parse(&a.to_string()), Some(a));
        }
        assert_eq!(ActionType::parse("destroy"), None);
    }
}
