use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of latency samples retained for percentile computation.
/// Oldest samples are evicted once the buffer is full.
const MAX_LATENCY_SAMPLES: usize = 1_000;

/// Atomic counters tracking one agent's message processing.
///
/// All counters use relaxed ordering; call [`snapshot`](Self::snapshot) for
/// a consistent point-in-time view.
#[derive(Debug, Default)]
pub struct AgentMetrics {
    /// Deliveries pulled from the bus.
    pub received: AtomicU64,
    /// Deliveries processed and acknowledged.
    pub acked: AtomicU64,
    /// Deliveries nacked for redelivery.
    pub nacked: AtomicU64,
    /// Messages published downstream.
    pub published: AtomicU64,
    /// Malformed bus messages.
    pub decode_errors: AtomicU64,
    /// Policy denials and constraint violations.
    pub validation_errors: AtomicU64,
    /// Retryable bus/store/policy failures.
    pub transient_errors: AtomicU64,
    /// Uniqueness/replay conflicts.
    pub conflict_errors: AtomicU64,
    /// Per-message processing latency samples (microseconds).
    latency_samples: parking_lot::Mutex<VecDeque<u64>>,
}

impl AgentMetrics {
    /// Record a processed delivery and its latency.
    pub fn record_processed(&self, latency_us: u64, acked: bool) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if acked {
            self.acked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.nacked.fetch_add(1, Ordering::Relaxed);
        }
        let mut buf = self.latency_samples.lock();
        if buf.len() >= MAX_LATENCY_SAMPLES {
            buf.pop_front();
        }
        buf.push_back(latency_us);
    }

    /// Record a downstream publish.
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error by taxonomy class (see `PipelineError::class`).
    pub fn record_error(&self, class: &str) {
        let counter = match class {
            "decode" => &self.decode_errors,
            "validation" => &self.validation_errors,
            "conflict" => &self.conflict_errors,
            _ => &self.transient_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent snapshot of all counters and latency percentiles.
    pub fn snapshot(&self) -> AgentMetricsSnapshot {
        let (p50, p95, p99, avg) = {
            let buf = self.latency_samples.lock();
            if buf.is_empty() {
                (0.0, 0.0, 0.0, 0.0)
            } else {
                let mut sorted: Vec<u64> = buf.iter().copied().collect();
                sorted.sort_unstable();
                #[allow(clippy::cast_precision_loss)]
                let avg =
                    sorted.iter().sum::<u64>() as f64 / sorted.len() as f64 / 1_000.0;
                (
                    percentile(&sorted, 50.0),
                    percentile(&sorted, 95.0),
                    percentile(&sorted, 99.0),
                    avg,
                )
            }
        };

        AgentMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            conflict_errors: self.conflict_errors.load(Ordering::Relaxed),
            avg_latency_ms: avg,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
        }
    }
}

/// Compute a percentile from sorted microsecond samples, in milliseconds.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    let idx = ((pct / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)] as f64 / 1_000.0
}

/// Plain-data snapshot of [`AgentMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct AgentMetricsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
    pub published: u64,
    pub decode_errors: u64,
    pub validation_errors: u64,
    pub transient_errors: u64,
    pub conflict_errors: u64,
    /// Mean processing latency in milliseconds.
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_snapshot_is_zero() {
        let m = AgentMetrics::default();
        let snap = m.snapshot();
        assert_eq!(snap.received, 0);
        assert_eq!(snap.acked, 0);
        assert_eq!(snap.p99_latency_ms, 0.0);
    }

    #[test]
    fn records_ack_nack_and_latency() {
        let m = AgentMetrics::default();
        m.record_processed(10_000, true);
        m.record_processed(20_000, false);
        m.record_published();

        let snap = m.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.acked, 1);
        assert_eq!(snap.nacked, 1);
        assert_eq!(snap.published, 1);
        assert!((snap.avg_latency_ms - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn errors_bucket_by_class() {
        let m = AgentMetrics::default();
        m.record_error("decode");
        m.record_error("validation");
        m.record_error("conflict");
        m.record_error("transient");
        m.record_error("anything-else");

        let snap = m.snapshot();
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.validation_errors, 1);
        assert_eq!(snap.conflict_errors, 1);
        assert_eq!(snap.transient_errors, 2);
    }

    #[test]
    fn latency_buffer_is_bounded() {
        let m = AgentMetrics::default();
        for i in 0..(MAX_LATENCY_SAMPLES as u64 + 100) {
            m.record_processed(i * 100, true);
        }
        let snap = m.snapshot();
        assert_eq!(snap.received, MAX_LATENCY_SAMPLES as u64 + 100);
        assert!(snap.p50_latency_ms > 0.0);
    }
}
