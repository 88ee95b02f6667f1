use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use aegis_core::subject_matches;

use crate::consumer::ConsumerConfig;
use crate::error::BusError;
use crate::stream::StreamConfig;

/// A message handed to a pull consumer. Must be acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Stream the message came from.
    pub stream: String,
    /// Consumer the delivery belongs to.
    pub consumer: String,
    /// Stream sequence of the message.
    pub stream_seq: u64,
    /// Subject the message was published on.
    pub subject: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Which delivery attempt this is (1 = first).
    pub deliver_count: u32,
}

/// A message fanned out to plain subscribers.
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Subject the message was published on.
    pub subject: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// The transport abstraction every stage talks to.
///
/// Delivery is at-least-once: a processor that nacks (or dies holding) a
/// delivery sees it again, so processors must be idempotent or duplicate
/// tolerant.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Create the stream if it does not already exist. An existing stream's
    /// configuration is left untouched.
    async fn ensure_stream(&self, config: StreamConfig) -> Result<(), BusError>;

    /// Create the durable consumer if it does not already exist.
    async fn ensure_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<(), BusError>;

    /// Append a message to every stream capturing `subject` and fan it out
    /// to plain subscribers.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Pull up to `batch` deliveries for a durable consumer, waiting at most
    /// `max_wait` for the first one. Returns an empty batch on timeout.
    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        max_wait: Duration,
    ) -> Result<Vec<Delivery>, BusError>;

    /// Acknowledge a delivery. On work-queue streams this removes the
    /// message from the stream.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Negatively acknowledge a delivery, making it immediately eligible
    /// for redelivery (bounded by the consumer's max-deliver).
    async fn nack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Open a plain (non-durable, non-queue) subscription over a subject
    /// filter. Lagging subscribers drop messages rather than blocking
    /// publishers.
    fn subscribe(&self, filter: &str) -> BusSubscription;

    /// Whether the bus connection is healthy.
    fn is_connected(&self) -> bool;
}

/// A plain subscription: a filtered view of the bus fan-out channel.
pub struct BusSubscription {
    filter: String,
    rx: broadcast::Receiver<BusEvent>,
}

impl BusSubscription {
    pub(crate) fn new(filter: impl Into<String>, rx: broadcast::Receiver<BusEvent>) -> Self {
        Self {
            filter: filter.into(),
            rx,
        }
    }

    /// Receive the next event matching the filter. Returns `None` once the
    /// bus is dropped. Lag is logged and skipped, never an error.
    pub async fn next(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if subject_matches(&self.filter, &event.subject) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, filter = %self.filter, "subscription lagged, skipping");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
