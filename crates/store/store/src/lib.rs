//! The canonical store abstraction.
//!
//! The store is the record of truth for tracks, detections, proposals,
//! decisions, effects, intervention rules, and system counters. Backends
//! must be `Send + Sync`; all invariants the pipeline leans on (one pending
//! proposal per track, unique idempotent effect keys, write-once terminal
//! statuses) are enforced *inside* the backend so that a violation is a
//! [`StoreError::Conflict`] regardless of implementation.

pub mod error;
pub mod query;
pub mod store;

pub use error::StoreError;
pub use query::{
    ActiveTrack, AuditEntry, ClearCounts, DecisionQuery, EffectInsert, EffectQuery,
    ProposalInsert, ProposalQuery, StageLatency, TrackQuery, percentile_ms,
};
pub use store::CanonicalStore;
