use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens to a message once it is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Messages are retained until evicted by the stream's limits.
    Limits,
    /// An acknowledged message is removed from the stream, so no other
    /// consumer can see it (consumed-once semantics).
    WorkQueue,
}

/// Which message is dropped when a full stream receives a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Evict the oldest stored message.
    Old,
    /// Reject the incoming message.
    New,
}

/// Configuration of a single stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream name (e.g. `DETECTIONS`).
    pub name: String,
    /// Subject filters this stream captures (e.g. `detect.>`).
    pub subjects: Vec<String>,
    /// Retention mode.
    pub retention: RetentionPolicy,
    /// Maximum message age before lazy eviction.
    pub max_age: Duration,
    /// Maximum total stored messages; 0 means unlimited.
    pub max_msgs: usize,
    /// Maximum stored messages per distinct subject; 0 means unlimited.
    pub max_msgs_per_subject: usize,
    /// Behavior when `max_msgs` is reached.
    pub discard: DiscardPolicy,
}

impl StreamConfig {
    /// Create a limits-retention stream over the given subject filters.
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(24 * 60 * 60),
            max_msgs: 100_000,
            max_msgs_per_subject: 0,
            discard: DiscardPolicy::Old,
        }
    }

    /// Switch to work-queue retention.
    #[must_use]
    pub fn work_queue(mut self) -> Self {
        self.retention = RetentionPolicy::WorkQueue;
        self
    }

    /// Set the age cap.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set the total message cap.
    #[must_use]
    pub fn with_max_msgs(mut self, max_msgs: usize) -> Self {
        self.max_msgs = max_msgs;
        self
    }

    /// Set the per-subject message cap.
    #[must_use]
    pub fn with_max_msgs_per_subject(mut self, cap: usize) -> Self {
        self.max_msgs_per_subject = cap;
        self
    }

    /// Whether this stream captures `subject`.
    #[must_use]
    pub fn captures(&self, subject: &str) -> bool {
        self.subjects
            .iter()
            .any(|f| aegis_core::subject_matches(f, subject))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_by_filter() {
        let s = StreamConfig::new("DETECTIONS", vec!["detect.>".into()]);
        assert!(s.captures("detect.s1.radar"));
        assert!(!s.captures("track.classified.hostile"));
    }

    #[test]
    fn builders_apply() {
        let s = StreamConfig::new("PROPOSALS", vec!["proposal.>".into()])
            .work_queue()
            .with_max_age(Duration::from_secs(3600))
            .with_max_msgs(10)
            .with_max_msgs_per_subject(5);
        assert_eq!(s.retention, RetentionPolicy::WorkQueue);
        assert_eq!(s.max_age, Duration::from_secs(3600));
        assert_eq!(s.max_msgs, 10);
        assert_eq!(s.max_msgs_per_subject, 5);
    }
}
