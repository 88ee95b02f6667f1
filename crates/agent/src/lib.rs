//! The shared runtime every pipeline stage is built on.
//!
//! An agent has an identity `(id, kind)`, a connection to the bus, a
//! metrics registry, and a cancellation-token-driven lifecycle. The
//! [`ConsumerLoop`] implements the common pull discipline: fetch a small
//! batch with a bounded wait, run each delivery through the stage's
//! [`Processor`], then ack or nack according to the error taxonomy.

pub mod backoff;
pub mod metrics;
pub mod runtime;

pub use backoff::Backoff;
pub use metrics::{AgentMetrics, AgentMetricsSnapshot};
pub use runtime::{ConsumerLoop, Processor};
