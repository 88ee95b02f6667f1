use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration of a durable pull consumer.
///
/// Consumers are explicit-ack: a delivery that is neither acked nor nacked
/// within `ack_wait` is redelivered, up to `max_deliver` total deliveries.
/// `max_ack_pending` bounds outstanding unacknowledged deliveries and is
/// the bus-side backpressure mechanism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Durable consumer name.
    pub name: String,
    /// Subject filter within the stream (e.g. `decision.approved.>`).
    pub filter_subject: String,
    /// How long a delivery may stay unacknowledged before redelivery.
    pub ack_wait: Duration,
    /// Total delivery attempts per message (first delivery included).
    pub max_deliver: u32,
    /// Maximum outstanding unacknowledged deliveries.
    pub max_ack_pending: usize,
}

impl ConsumerConfig {
    /// Create a consumer with the stage defaults: 30 s ack-wait, 3
    /// deliveries, 100 outstanding.
    pub fn new(name: impl Into<String>, filter_subject: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter_subject: filter_subject.into(),
            ack_wait: Duration::from_secs(30),
            max_deliver: 3,
            max_ack_pending: 100,
        }
    }

    /// Set the ack-wait interval.
    #[must_use]
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Set the delivery budget.
    #[must_use]
    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    /// Set the outstanding-delivery cap.
    #[must_use]
    pub fn with_max_ack_pending(mut self, max_ack_pending: usize) -> Self {
        self.max_ack_pending = max_ack_pending;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stage_discipline() {
        let c = ConsumerConfig::new("classifier", "detect.>");
        assert_eq!(c.ack_wait, Duration::from_secs(30));
        assert_eq!(c.max_deliver, 3);
        assert_eq!(c.max_ack_pending, 100);
    }

    #[test]
    fn builders_apply() {
        let c = ConsumerConfig::new("authorizer", "proposal.>")
            .with_ack_wait(Duration::from_secs(300))
            .with_max_deliver(1)
            .with_max_ack_pending(50);
        assert_eq!(c.ack_wait, Duration::from_secs(300));
        assert_eq!(c.max_deliver, 1);
        assert_eq!(c.max_ack_pending, 50);
    }
}
