//! Dot-segmented subject names and wildcard matching.
//!
//! Subjects are hierarchical: `detect.<sensor_id>.<sensor_type>`,
//! `track.classified.<classification>`, `track.correlated.<threat_level>`,
//! `proposal.pending.<bucket>`, `decision.{approved|denied}.<action_type>`,
//! `effect.<status>.<action_type>`. Filters may use `*` to match exactly one
//! token and a trailing `>` to match one or more remaining tokens.

use crate::effect::EffectStatus;
use crate::proposal::ActionType;
use crate::track::{Classification, ThreatLevel};

/// Subject name constructors for every pipeline domain.
pub struct Subject;

impl Subject {
    /// Filter covering all detections.
    pub const DETECT_ALL: &'static str = "detect.>";
    /// Filter covering all classified tracks.
    pub const TRACK_CLASSIFIED_ALL: &'static str = "track.classified.>";
    /// Filter covering all correlated tracks.
    pub const TRACK_CORRELATED_ALL: &'static str = "track.correlated.>";
    /// Filter covering all tracks (classified and correlated).
    pub const TRACK_ALL: &'static str = "track.>";
    /// Filter covering all pending proposals.
    pub const PROPOSAL_ALL: &'static str = "proposal.>";
    /// Filter covering all decisions.
    pub const DECISION_ALL: &'static str = "decision.>";
    /// Filter covering approved decisions only.
    pub const DECISION_APPROVED_ALL: &'static str = "decision.approved.>";
    /// Filter covering all effects.
    pub const EFFECT_ALL: &'static str = "effect.>";

    /// `detect.<sensor_id>.<sensor_type>`
    #[must_use]
    pub fn detect(sensor_id: &str, sensor_type: &str) -> String {
        format!("detect.{sensor_id}.{sensor_type}")
    }

    /// `track.classified.<classification>`
    #[must_use]
    pub fn classified(classification: Classification) -> String {
        format!("track.classified.{classification}")
    }

    /// `track.correlated.<threat_level>`
    #[must_use]
    pub fn correlated(threat: ThreatLevel) -> String {
        format!("track.correlated.{threat}")
    }

    /// `proposal.pending.<bucket>` where the bucket is derived from priority.
    #[must_use]
    pub fn proposal_pending(priority: u8) -> String {
        format!("proposal.pending.{}", crate::proposal::priority_bucket(priority))
    }

    /// `decision.approved.<action_type>` or `decision.denied.<action_type>`.
    #[must_use]
    pub fn decision(approved: bool, action_type: ActionType) -> String {
        let verdict = if approved { "approved" } else { "denied" };
        format!("decision.{verdict}.{action_type}")
    }

    /// `effect.<status>.<action_type>`
    #[must_use]
    pub fn effect(status: EffectStatus, action_type: ActionType) -> String {
        format!("effect.{status}.{action_type}")
    }
}

/// Whether `subject` matches `filter`.
///
/// `*` matches exactly one token; a trailing `>` matches one or more
/// remaining tokens. Literal tokens must match exactly.
#[must_use]
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(">"), None) => return false,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match() {
        assert!(subject_matches("detect.s1.radar", "detect.s1.radar"));
        assert!(!subject_matches("detect.s1.radar", "detect.s1.eo"));
        assert!(!subject_matches("detect.s1", "detect.s1.radar"));
    }

    #[test]
    fn star_matches_one_token() {
        assert!(subject_matches("track.*.hostile", "track.classified.hostile"));
        assert!(!subject_matches("track.*", "track.classified.hostile"));
    }

    #[test]
    fn gt_matches_tail() {
        assert!(subject_matches("detect.>", "detect.s1.radar"));
        assert!(subject_matches("track.>", "track.correlated.critical"));
        assert!(subject_matches("proposal.>", "proposal.pending.high"));
        // `>` requires at least one remaining token.
        assert!(!subject_matches("detect.>", "detect"));
    }

    #[test]
    fn constructors() {
        assert_eq!(Subject::detect("s1", "radar"), "detect.s1.radar");
        assert_eq!(
            Subject::classified(Classification::Hostile),
            "track.classified.hostile"
        );
        assert_eq!(
            Subject::correlated(ThreatLevel::Critical),
            "track.correlated.critical"
        );
        assert_eq!(
            Subject::decision(true, ActionType::Engage),
            "decision.approved.engage"
        );
        assert_eq!(
            Subject::effect(EffectStatus::Executed, ActionType::Monitor),
            "effect.executed.monitor"
        );
    }

    #[test]
    fn proposal_bucket_boundaries() {
        assert_eq!(Subject::proposal_pending(10), "proposal.pending.high");
        assert_eq!(Subject::proposal_pending(8), "proposal.pending.high");
        assert_eq!(Subject::proposal_pending(7), "proposal.pending.medium");
        assert_eq!(Subject::proposal_pending(5), "proposal.pending.medium");
        assert_eq!(Subject::proposal_pending(4), "proposal.pending.normal");
        assert_eq!(Subject::proposal_pending(1), "proposal.pending.normal");
    }
}
