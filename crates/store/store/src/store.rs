use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use aegis_core::{
    ActionProposal, CorrelatedTrack, Decision, Detection, EffectRecord, EffectStatus,
    InterventionRule, ProposalId, ProposalStatus, RuleId, TrackId,
};

use crate::error::StoreError;
use crate::query::{
    ActiveTrack, AuditEntry, ClearCounts, DecisionQuery, EffectInsert, EffectQuery,
    ProposalInsert, ProposalQuery, StageLatency, TrackQuery,
};

/// The canonical store of record.
///
/// Implementations must be `Send + Sync` to be shared across agents and the
/// API layer. All cross-row invariants live behind this trait:
///
/// - at most one `pending` proposal per track (`insert_proposal`),
/// - one decision per proposal (`insert_decision`),
/// - unique effect idempotent keys (`insert_effect`),
/// - `pending -> terminal` only, terminal write-once (`transition_*`).
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    // -- Tracks ----------------------------------------------------------

    /// Insert or update the canonical track row. Detection counts are
    /// monotonic: an upsert carrying a lower count than the stored row
    /// keeps the stored count.
    async fn upsert_track(&self, track: &CorrelatedTrack) -> Result<(), StoreError>;

    /// Fetch a track by external id.
    async fn get_track(&self, id: &TrackId) -> Result<Option<CorrelatedTrack>, StoreError>;

    /// List tracks matching the filters, most recently updated first.
    async fn list_tracks(&self, query: &TrackQuery) -> Result<Vec<CorrelatedTrack>, StoreError>;

    /// The active-tracks view: tracks updated at or after `since`, each
    /// joined with its pending-proposal count.
    async fn active_tracks(&self, since: DateTime<Utc>) -> Result<Vec<ActiveTrack>, StoreError>;

    /// Delete tracks whose `last_updated` is before `cutoff`. Returns the
    /// number removed.
    async fn prune_tracks(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // -- Detections ------------------------------------------------------

    /// Append a raw detection to the track's history.
    async fn insert_detection(&self, detection: &Detection) -> Result<(), StoreError>;

    /// Page through a track's detection history, newest first.
    async fn track_history(
        &self,
        id: &TrackId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Detection>, StoreError>;

    // -- Proposals -------------------------------------------------------

    /// Insert a proposal as `pending`. If the track already has a pending
    /// proposal, the existing row's `hit_count`/`last_hit_at` are bumped
    /// and returned instead.
    async fn insert_proposal(&self, proposal: &ActionProposal)
    -> Result<ProposalInsert, StoreError>;

    /// Fetch a proposal by id.
    async fn get_proposal(&self, id: &ProposalId) -> Result<Option<ActionProposal>, StoreError>;

    /// List proposals matching the filters, newest first.
    async fn list_proposals(
        &self,
        query: &ProposalQuery,
    ) -> Result<Vec<ActionProposal>, StoreError>;

    /// The pending queue view: unexpired pending proposals ordered by
    /// priority descending, then creation time.
    async fn pending_queue(&self, now: DateTime<Utc>) -> Result<Vec<ActionProposal>, StoreError>;

    /// Move a proposal out of `pending`. Returns the updated row, or
    /// [`StoreError::Conflict`] when the proposal is not pending (or the
    /// transition is otherwise illegal), or [`StoreError::NotFound`].
    async fn transition_proposal(
        &self,
        id: &ProposalId,
        to: ProposalStatus,
    ) -> Result<ActionProposal, StoreError>;

    /// Mark all pending proposals whose deadline has passed as `expired`
    /// and return them.
    async fn expire_due_proposals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActionProposal>, StoreError>;

    // -- Decisions -------------------------------------------------------

    /// Record a decision. Fails with [`StoreError::Conflict`] if the
    /// proposal already has one, and [`StoreError::NotFound`] if the
    /// proposal does not exist.
    async fn insert_decision(&self, decision: &Decision) -> Result<(), StoreError>;

    /// List decisions matching the filters, newest first.
    async fn list_decisions(&self, query: &DecisionQuery) -> Result<Vec<Decision>, StoreError>;

    // -- Effects ---------------------------------------------------------

    /// Insert an effect row in `pending` state. A duplicate idempotent key
    /// is a replay: the stored row is returned untouched.
    async fn insert_effect(&self, effect: &EffectRecord) -> Result<EffectInsert, StoreError>;

    /// Transition an effect to a terminal status by idempotent key. A
    /// terminal row is write-once: transitioning it again is a
    /// [`StoreError::Conflict`].
    async fn transition_effect(
        &self,
        idempotent_key: &str,
        to: EffectStatus,
        executed_at: DateTime<Utc>,
        result: &str,
    ) -> Result<EffectRecord, StoreError>;

    /// Fetch an effect by idempotent key.
    async fn get_effect_by_key(&self, idempotent_key: &str)
    -> Result<Option<EffectRecord>, StoreError>;

    /// List effects matching the filters, newest first.
    async fn list_effects(&self, query: &EffectQuery) -> Result<Vec<EffectRecord>, StoreError>;

    // -- Audit & metrics -------------------------------------------------

    /// The flattened audit trail: proposals joined with their decision and
    /// effect, newest proposal first.
    async fn audit_trail(&self, limit: usize, offset: usize)
    -> Result<Vec<AuditEntry>, StoreError>;

    /// Stage latency aggregates computed from the
    /// proposal -> decision -> effect join chain.
    async fn stage_metrics(&self) -> Result<Vec<StageLatency>, StoreError>;

    // -- Intervention rules ----------------------------------------------

    /// Insert a rule. Duplicate names are a [`StoreError::Conflict`].
    async fn insert_rule(&self, rule: &InterventionRule) -> Result<(), StoreError>;

    /// Replace a rule by id.
    async fn update_rule(&self, rule: &InterventionRule) -> Result<(), StoreError>;

    /// Delete a rule. Returns `false` when the rule did not exist.
    async fn delete_rule(&self, id: &RuleId) -> Result<bool, StoreError>;

    /// Fetch a rule by id.
    async fn get_rule(&self, id: &RuleId) -> Result<Option<InterventionRule>, StoreError>;

    /// All rules, ordered by `evaluation_order`.
    async fn list_rules(&self) -> Result<Vec<InterventionRule>, StoreError>;

    // -- Counters --------------------------------------------------------

    /// Atomically add `delta` to a named counter, returning the new value.
    async fn increment_counter(&self, name: &str, delta: i64) -> Result<i64, StoreError>;

    /// Snapshot of all counters.
    async fn counters(&self) -> Result<HashMap<String, i64>, StoreError>;

    // -- Admin -----------------------------------------------------------

    /// Truncate the domain tables in foreign-key order
    /// (effects -> decisions -> proposals -> detections -> tracks) inside a
    /// single transaction, and reset all counters. Returns per-table
    /// deletion counts.
    async fn clear_all(&self) -> Result<ClearCounts, StoreError>;

    /// Cheap connectivity check for health reporting.
    async fn ping(&self) -> Result<(), StoreError>;
}
