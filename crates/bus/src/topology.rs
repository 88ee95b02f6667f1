//! The pipeline's stream and consumer topology.
//!
//! One stream per domain, with the retention discipline each domain needs:
//! detections and tracks are rolling windows, proposals are a work queue
//! (consumed once by the authorizer), decisions and effects are long-lived
//! audit streams.

use std::time::Duration;

use crate::consumer::ConsumerConfig;
use crate::stream::StreamConfig;

/// Stream name constants.
pub const DETECTIONS: &str = "DETECTIONS";
pub const TRACKS: &str = "TRACKS";
pub const PROPOSALS: &str = "PROPOSALS";
pub const DECISIONS: &str = "DECISIONS";
pub const EFFECTS: &str = "EFFECTS";

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// `DETECTIONS`: 24 h rolling window, capped per subject so a runaway
/// sensor cannot crowd out the others.
#[must_use]
pub fn detections() -> StreamConfig {
    StreamConfig::new(DETECTIONS, vec!["detect.>".into()])
        .with_max_age(Duration::from_secs(DAY))
        .with_max_msgs(500_000)
        .with_max_msgs_per_subject(10_000)
}

/// `TRACKS`: 72 h window feeding the correlator and planner.
#[must_use]
pub fn tracks() -> StreamConfig {
    StreamConfig::new(TRACKS, vec!["track.>".into()])
        .with_max_age(Duration::from_secs(3 * DAY))
        .with_max_msgs(500_000)
}

/// `PROPOSALS`: work-queue retention, 1 h cap. An acked proposal is gone.
#[must_use]
pub fn proposals() -> StreamConfig {
    StreamConfig::new(PROPOSALS, vec!["proposal.>".into()])
        .work_queue()
        .with_max_age(Duration::from_secs(HOUR))
        .with_max_msgs(100_000)
}

/// `DECISIONS`: 7 d audit durability.
#[must_use]
pub fn decisions() -> StreamConfig {
    StreamConfig::new(DECISIONS, vec!["decision.>".into()])
        .with_max_age(Duration::from_secs(7 * DAY))
        .with_max_msgs(500_000)
}

/// `EFFECTS`: 30 d audit durability.
#[must_use]
pub fn effects() -> StreamConfig {
    StreamConfig::new(EFFECTS, vec!["effect.>".into()])
        .with_max_age(Duration::from_secs(30 * DAY))
        .with_max_msgs(500_000)
}

/// All five pipeline streams.
#[must_use]
pub fn pipeline_streams() -> Vec<StreamConfig> {
    vec![detections(), tracks(), proposals(), decisions(), effects()]
}

/// Classifier consumer over raw detections.
#[must_use]
pub fn classifier_consumer() -> ConsumerConfig {
    ConsumerConfig::new("classifier", "detect.>")
}

/// Correlator consumer over classified tracks.
#[must_use]
pub fn correlator_consumer() -> ConsumerConfig {
    ConsumerConfig::new("correlator", "track.classified.>")
}

/// Planner consumer over correlated tracks.
#[must_use]
pub fn planner_consumer() -> ConsumerConfig {
    ConsumerConfig::new("planner", "track.correlated.>")
}

/// Authorizer consumer over the proposal work queue. Ack-wait is long
/// because human decisions legitimately take minutes; max-deliver is 1
/// because a redelivered human proposal risks a double decision.
#[must_use]
pub fn authorizer_consumer() -> ConsumerConfig {
    ConsumerConfig::new("authorizer", "proposal.>")
        .with_ack_wait(Duration::from_secs(300))
        .with_max_deliver(1)
        .with_max_ack_pending(200)
}

/// Effector consumer over approved decisions. The highest retry budget in
/// the pipeline; the store-level idempotent key makes the retries safe.
#[must_use]
pub fn effector_consumer() -> ConsumerConfig {
    ConsumerConfig::new("effector", "decision.approved.>")
        .with_max_deliver(5)
        .with_max_ack_pending(50)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::RetentionPolicy;

    #[test]
    fn proposals_are_a_work_queue_and_the_rest_are_not() {
        for s in pipeline_streams() {
            if s.name == PROPOSALS {
                assert_eq!(s.retention, RetentionPolicy::WorkQueue);
            } else {
                assert_eq!(s.retention, RetentionPolicy::Limits);
            }
        }
    }

    #[test]
    fn age_caps_match_the_domain_table() {
        assert_eq!(detections().max_age, Duration::from_secs(DAY));
        assert_eq!(tracks().max_age, Duration::from_secs(3 * DAY));
        assert_eq!(proposals().max_age, Duration::from_secs(HOUR));
        assert_eq!(decisions().max_age, Duration::from_secs(7 * DAY));
        assert_eq!(effects().max_age, Duration::from_secs(30 * DAY));
    }

    #[test]
    fn authorizer_discipline() {
        let c = authorizer_consumer();
        assert_eq!(c.ack_wait, Duration::from_secs(300));
        assert_eq!(c.max_deliver, 1);
    }

    #[test]
    fn effector_discipline() {
        let c = effector_consumer();
        assert_eq!(c.max_deliver, 5);
        assert_eq!(c.filter_subject, "decision.approved.>");
    }
}
