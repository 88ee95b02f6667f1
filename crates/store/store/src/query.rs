//! Query filters, insert outcomes, and derived-view row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aegis_core::{
    ActionProposal, ActionType, Classification, CorrelatedTrack, Decision, EffectRecord,
    EffectStatus, ProposalStatus, ThreatLevel, TrackId, TrackType,
};

/// Default page size for list queries.
pub const DEFAULT_LIMIT: usize = 100;

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

/// Filters for listing tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackQuery {
    /// Filter by classification.
    pub classification: Option<Classification>,
    /// Filter by threat level.
    pub threat_level: Option<ThreatLevel>,
    /// Filter by platform category.
    pub track_type: Option<TrackType>,
    /// Only tracks updated at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Page size.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Page offset.
    #[serde(default)]
    pub offset: usize,
}

impl Default for TrackQuery {
    fn default() -> Self {
        Self {
            classification: None,
            threat_level: None,
            track_type: None,
            since: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// Filters for listing proposals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalQuery {
    /// Filter by lifecycle status.
    pub status: Option<ProposalStatus>,
    /// Filter by target track.
    pub track_id: Option<TrackId>,
    /// Filter by action.
    pub action_type: Option<ActionType>,
    /// Filter by the threat level recorded at proposal time.
    pub threat_level: Option<ThreatLevel>,
    /// Page size.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Page offset.
    #[serde(default)]
    pub offset: usize,
}

impl Default for ProposalQuery {
    fn default() -> Self {
        Self {
            status: None,
            track_id: None,
            action_type: None,
            threat_level: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// Filters for listing decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionQuery {
    /// Filter by verdict.
    pub approved: Option<bool>,
    /// Filter by target track.
    pub track_id: Option<TrackId>,
    /// Filter by action.
    pub action_type: Option<ActionType>,
    /// Only decisions made at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Page size.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Page offset.
    #[serde(default)]
    pub offset: usize,
}

impl Default for DecisionQuery {
    fn default() -> Self {
        Self {
            approved: None,
            track_id: None,
            action_type: None,
            since: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// Filters for listing effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectQuery {
    /// Filter by status.
    pub status: Option<EffectStatus>,
    /// Filter by target track.
    pub track_id: Option<TrackId>,
    /// Filter by action.
    pub action_type: Option<ActionType>,
    /// Only effects created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Page size.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Page offset.
    #[serde(default)]
    pub offset: usize,
}

impl Default for EffectQuery {
    fn default() -> Self {
        Self {
            status: None,
            track_id: None,
            action_type: None,
            since: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// Outcome of a proposal insert.
///
/// The at-most-one-pending-per-track invariant is enforced by the backend
/// (a partial unique index in Postgres). A duplicate is not an error: the
/// existing row's hit counter is bumped and returned.
#[derive(Debug, Clone)]
pub enum ProposalInsert {
    /// The proposal was stored as a new pending row.
    Inserted,
    /// A pending proposal for the track already existed; its `hit_count`
    /// and `last_hit_at` were updated and the incoming row was dropped.
    DuplicatePending(ActionProposal),
}

/// Outcome of an effect insert.
#[derive(Debug, Clone)]
pub enum EffectInsert {
    /// A new effect row was created in `pending` state.
    Inserted,
    /// The idempotent key already exists: this is a replay. The stored row
    /// is returned so the caller can report its status without executing.
    Replay(EffectRecord),
}

/// A row of the active-tracks view: the track plus its pending workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTrack {
    /// The canonical track.
    #[serde(flatten)]
    pub track: CorrelatedTrack,
    /// Number of pending proposals targeting the track.
    pub pending_proposals: u64,
}

/// One row of the flattened decision audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// The proposal.
    pub proposal: ActionProposal,
    /// The decision that terminated it, if any.
    pub decision: Option<Decision>,
    /// The effect the decision released, if any.
    pub effect: Option<EffectRecord>,
}

/// Per-table deletion counts returned by `clear_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearCounts {
    pub effects: u64,
    pub decisions: u64,
    pub proposals: u64,
    pub detections: u64,
    pub tracks: u64,
}

impl ClearCounts {
    /// Total rows removed.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.effects + self.decisions + self.proposals + self.detections + self.tracks
    }
}

/// Latency aggregate for one pipeline stage transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLatency {
    /// Stage transition name (e.g. `proposal_to_decision`).
    pub stage: String,
    /// Number of samples.
    pub count: u64,
    /// Mean latency in milliseconds.
    pub avg_ms: f64,
    /// Median latency in milliseconds.
    pub p50_ms: f64,
    /// 95th percentile latency in milliseconds.
    pub p95_ms: f64,
    /// 99th percentile latency in milliseconds.
    pub p99_ms: f64,
}

/// Compute a percentile from an ascending-sorted sample slice (ms).
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn percentile_ms(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((pct / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_queries_use_page_defaults() {
        assert_eq!(TrackQuery::default().limit, DEFAULT_LIMIT);
        assert_eq!(ProposalQuery::default().offset, 0);
    }

    #[test]
    fn clear_counts_total() {
        let counts = ClearCounts {
            effects: 1,
            decisions: 2,
            proposals: 3,
            detections: 4,
            tracks: 5,
        };
        assert_eq!(counts.total(), 15);
    }

    #[test]
    fn percentile_edges() {
        assert_eq!(percentile_ms(&[], 50.0), 0.0);
        assert_eq!(percentile_ms(&[42.0], 99.0), 42.0);
        let samples: Vec<f64> = (1..=100).map(f64::from).collect();
        assert!((percentile_ms(&samples, 50.0) - 50.0).abs() < 2.0);
        assert!((percentile_ms(&samples, 95.0) - 95.0).abs() < 2.0);
    }
}
