//! Embedded durable message log for the Aegis pipeline.
//!
//! The bus provides the delivery semantics the pipeline depends on without
//! binding to a particular broker: per-domain append-only streams with
//! retention limits, durable pull consumers with explicit ack/nack and
//! redelivery on ack-wait expiry, work-queue retention for consumed-once
//! domains, and plain bounded-buffer subscriptions for fan-out consumers
//! such as the push hub.
//!
//! [`InMemoryBus`] is the in-process implementation; anything speaking the
//! [`MessageBus`] trait (e.g. a networked broker adapter) can substitute
//! for it.

pub mod bus;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod stream;
pub mod topology;

pub use bus::{BusEvent, BusSubscription, Delivery, MessageBus};
pub use consumer::ConsumerConfig;
pub use error::BusError;
pub use memory::InMemoryBus;
pub use stream::{DiscardPolicy, RetentionPolicy, StreamConfig};
