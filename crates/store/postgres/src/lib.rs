//! PostgreSQL implementation of [`aegis_store::CanonicalStore`].
//!
//! The load-bearing pieces of the schema:
//!
//! - a partial unique index `proposals(track_id) WHERE status = 'pending'`
//!   enforcing at most one pending proposal per track,
//! - a unique constraint on `effects(idempotent_key)` making effect
//!   execution at-most-once under redelivery,
//! - a unique constraint on `decisions(proposal_id)` so each proposal
//!   terminates in at most one decision,
//! - an upsert-returning counters table for atomic named counters.

pub mod config;
pub mod migrations;
mod rows;
pub mod store;

pub use config::PostgresConfig;
pub use store::PostgresStore;
