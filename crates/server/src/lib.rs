//! The Aegis server: HTTP API, WebSocket push hub, and the host process
//! for the pipeline stages.
//!
//! The server owns the embedded bus and the canonical store, runs the six
//! stages as cooperative tasks, mirrors selected bus subjects to connected
//! WebSocket clients, and exposes the canonical state over HTTP -- including
//! the decide endpoint that moves human-gated proposals forward.
//!
//! Two binaries ship from this crate: `aegis-server` (everything above)
//! and `aegis-agentd`, a headless host for the same stages used when the
//! HTTP surface runs elsewhere with `agents.enabled = false`.

pub mod api;
pub mod config;
pub mod error;
pub mod persist;
pub mod pipeline;
pub mod telemetry;
pub mod ws;

pub use config::AegisConfig;
pub use error::ApiError;
