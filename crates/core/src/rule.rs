//! Intervention rules: declarative predicates that decide whether a
//! proposal needs a human decision or may be auto-approved.
//!
//! Rules are walked in ascending `evaluation_order`, skipping disabled
//! rows; the first rule whose match predicate holds determines the verdict.
//! An empty match set matches everything. When no rule matches, the default
//! is to require human approval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proposal::{ActionProposal, ActionType};
use crate::track::{Classification, ThreatLevel, TrackType};
use crate::types::RuleId;

/// Verdict of a matched rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleVerdict {
    /// Leave the proposal pending for a human decision.
    RequiresApproval,
    /// Decide immediately with `approved_by = "system-<rule_id>"`.
    AutoApprove,
}

/// A single intervention rule row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionRule {
    /// Rule identifier.
    pub rule_id: RuleId,
    /// Unique human-readable name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Action types this rule applies to; empty matches all.
    #[serde(default)]
    pub action_types: Vec<ActionType>,
    /// Threat levels this rule applies to; empty matches all.
    #[serde(default)]
    pub threat_levels: Vec<ThreatLevel>,
    /// Classifications this rule applies to; empty matches all.
    #[serde(default)]
    pub classifications: Vec<Classification>,
    /// Track types this rule applies to; empty matches all.
    #[serde(default)]
    pub track_types: Vec<TrackType>,
    /// Inclusive lower priority bound.
    pub min_priority: u8,
    /// Inclusive upper priority bound.
    pub max_priority: u8,
    /// Verdict when the rule matches.
    pub verdict: RuleVerdict,
    /// Evaluation position; lower runs first.
    pub evaluation_order: i32,
    /// Disabled rules are skipped.
    pub enabled: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl InterventionRule {
    /// Validate the priority window.
    pub fn validate(&self) -> Result<(), crate::error::PipelineError> {
        if self.name.is_empty() {
            return Err(crate::error::PipelineError::Validation(
                "rule name must not be empty".to_owned(),
            ));
        }
        if self.min_priority > self.max_priority {
            return Err(crate::error::PipelineError::Validation(format!(
                "min_priority {} exceeds max_priority {}",
                self.min_priority, self.max_priority
            )));
        }
        Ok(())
    }

    /// Whether this rule's predicate holds for `proposal`.
    #[must_use]
    pub fn matches(&self, proposal: &ActionProposal) -> bool {
        if !self.action_types.is_empty() && !self.action_types.contains(&proposal.action_type) {
            return false;
        }
        if !self.threat_levels.is_empty() && !self.threat_levels.contains(&proposal.threat_level) {
            return false;
        }
        if !self.classifications.is_empty()
            && !self.classifications.contains(&proposal.classification)
        {
            return false;
        }
        if !self.track_types.is_empty() && !self.track_types.contains(&proposal.track_type) {
            return false;
        }
        (self.min_priority..=self.max_priority).contains(&proposal.priority)
    }
}

/// Walk `rules` in ascending `evaluation_order` and return the first
/// matching enabled rule, or `None` when nothing matches (the caller
/// defaults to requiring approval).
#[must_use]
pub fn evaluate_rules<'a>(
    rules: &'a [InterventionRule],
    proposal: &ActionProposal,
) -> Option<&'a InterventionRule> {
    let mut ordered: Vec<&InterventionRule> = rules.iter().filter(|r| r.enabled).collect();
    ordered.sort_by_key(|r| r.evaluation_order);
    ordered.into_iter().find(|r| r.matches(proposal))
}
