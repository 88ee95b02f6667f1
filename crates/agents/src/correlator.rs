//! The correlator: fuses classified tracks into canonical correlated
//! tracks and assigns threat levels.
//!
//! The working set is keyed by external track id and owned by the
//! processing task; no shared mutation. Per-track arrival order is
//! preserved within one correlator instance, and partitioning by external
//! track id preserves it when scaling out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use aegis_agent::{AgentMetrics, Processor};
use aegis_bus::{Delivery, MessageBus};
use aegis_core::{
    BusMessage, Classification, ClassifiedTrack, CorrelatedTrack, Envelope, PipelineError,
    SigningKey, Subject, ThreatConfig, TrackId, assess_threat,
};

/// Correlator tuning.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Maximum gap between an incoming update and a working-set entry for
    /// the two to merge.
    pub correlation_window: Duration,
    /// Threat-assignment thresholds.
    pub threat: ThreatConfig,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            correlation_window: Duration::seconds(10),
            threat: ThreatConfig::default(),
        }
    }
}

/// The correlator stage. Consumes `track.classified.>`, emits
/// `track.correlated.<threat_level>`.
pub struct Correlator {
    agent_id: String,
    bus: Arc<dyn MessageBus>,
    key: Option<SigningKey>,
    config: CorrelatorConfig,
    metrics: Arc<AgentMetrics>,
    working: HashMap<TrackId, CorrelatedTrack>,
}

impl Correlator {
    /// Create a correlator with an empty working set.
    pub fn new(
        agent_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        key: Option<SigningKey>,
        config: CorrelatorConfig,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
            key,
            config,
            metrics,
            working: HashMap::new(),
        }
    }

    /// Number of tracks currently in the working set.
    #[must_use]
    pub fn working_set_len(&self) -> usize {
        self.working.len()
    }

    /// Merge an update into the working set, or start a fresh correlated
    /// track. Returns the committed state.
    fn correlate(&mut self, incoming: &ClassifiedTrack) -> CorrelatedTrack {
        let window = self.config.correlation_window;
        let merged = match self.working.remove(&incoming.track_id) {
            Some(existing)
                if in_window(incoming.last_updated, existing.last_updated, window) =>
            {
                merge(existing, incoming)
            }
            Some(stale) => {
                // Same external id seen again outside the window: a new
                // correlation interval, but detection counts stay monotonic
                // per track id.
                let mut fresh = start_track(incoming);
                fresh.detection_count = stale.detection_count + 1;
                fresh.first_seen = stale.first_seen.min(incoming.first_seen);
                fresh
            }
            None => start_track(incoming),
        };

        let mut committed = merged;
        committed.threat_level = assess_threat(
            committed.classification,
            committed.track_type,
            &committed.position,
            &committed.velocity,
            &self.config.threat,
        );
        self.working
            .insert(committed.track_id.clone(), committed.clone());
        committed
    }

    /// Drop working-set entries idle for several windows; their next update
    /// starts a new interval anyway.
    fn evict_stale(&mut self, now: DateTime<Utc>) {
        let horizon = self.config.correlation_window * 6;
        self.working.retain(|_, t| now - t.last_updated <= horizon);
    }
}

fn in_window(a: DateTime<Utc>, b: DateTime<Utc>, window: Duration) -> bool {
    (a - b).abs() <= window
}

fn start_track(incoming: &ClassifiedTrack) -> CorrelatedTrack {
    CorrelatedTrack {
        track_id: incoming.track_id.clone(),
        classification: incoming.classification,
        track_type: incoming.track_type,
        position: incoming.position,
        velocity: incoming.velocity,
        confidence: incoming.confidence,
        threat_level: aegis_core::ThreatLevel::Low,
        merged_from: std::iter::once(incoming.track_id.as_str().to_owned()).collect(),
        sources: incoming.sources.clone(),
        detection_count: incoming.detection_count.max(1),
        window_start: incoming.last_updated,
        window_end: incoming.last_updated,
        first_seen: incoming.first_seen,
        last_updated: incoming.last_updated,
    }
}

/// Merge an in-window update into an existing correlated track: newer
/// kinematics, union of sources, widened window, monotonic detection
/// count. The classification with the higher confidence wins, except that
/// anything concrete upgrades `unknown`.
fn merge(mut existing: CorrelatedTrack, incoming: &ClassifiedTrack) -> CorrelatedTrack {
    if incoming.last_updated >= existing.last_updated {
        existing.position = incoming.position;
        existing.velocity = incoming.velocity;
    }

    let upgrade_unknown = existing.classification == Classification::Unknown
        && incoming.classification != Classification::Unknown;
    if upgrade_unknown || incoming.confidence > existing.confidence {
        existing.classification = incoming.classification;
        existing.confidence = incoming.confidence;
        if incoming.track_type != aegis_core::TrackType::Unknown {
            existing.track_type = incoming.track_type;
        }
    }

    existing.sources.extend(incoming.sources.iter().cloned());
    existing
        .merged_from
        .insert(incoming.track_id.as_str().to_owned());
    existing.detection_count += 1;
    existing.window_start = existing.window_start.min(incoming.last_updated);
    existing.window_end = existing.window_end.max(incoming.last_updated);
    existing.first_seen = existing.first_seen.min(incoming.first_seen);
    existing.last_updated = existing.last_updated.max(incoming.last_updated);
    existing
}

#[async_trait]
impl Processor for Correlator {
    async fn process(&mut self, delivery: &Delivery) -> Result<(), PipelineError> {
        let message: BusMessage<ClassifiedTrack> = BusMessage::from_bytes(&delivery.payload)?;
        let committed = self.correlate(&message.body);
        self.evict_stale(Utc::now());

        let envelope = Envelope::child_of(&message.envelope, &self.agent_id, "correlator");
        let mut outgoing = BusMessage::new(envelope, committed);
        if let Some(ref key) = self.key {
            outgoing.sign(key)?;
        }

        let subject = Subject::correlated(outgoing.body.threat_level);
        self.bus
            .publish(&subject, outgoing.to_bytes()?)
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;
        self.metrics.record_published();
        debug!(
            track_id = %outgoing.body.track_id,
            threat = %outgoing.body.threat_level,
            detections = outgoing.body.detection_count,
            "track correlated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use aegis_bus::InMemoryBus;
    use aegis_core::{GeoPosition, ThreatLevel, TrackType, Velocity};

    fn classified(
        id: &str,
        classification: Classification,
        track_type: TrackType,
        speed: f64,
        at: DateTime<Utc>,
        source: &str,
        confidence: f64,
    ) -> ClassifiedTrack {
        ClassifiedTrack {
            track_id: TrackId::new(id),
            classification,
            track_type,
            position: GeoPosition { lat: 5.0, lon: 5.0, alt: 8000.0 },
            velocity: Velocity { speed, heading: 180.0 },
            confidence,
            detection_count: 1,
            first_seen: at,
            last_updated: at,
            sources: BTreeSet::from([source.to_owned()]),
        }
    }

    fn correlator() -> (Arc<InMemoryBus>, Correlator) {
        let bus = Arc::new(InMemoryBus::new());
        let c = Correlator::new(
            "correlator-1",
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            None,
            CorrelatorConfig::default(),
            Arc::new(AgentMetrics::default()),
        );
        (bus, c)
    }

    #[test]
    fn merges_within_window_and_counts_detections() {
        let (_bus, mut c) = correlator();
        let now = Utc::now();
        let first = classified("T1", Classification::Hostile, TrackType::Aircraft, 200.0, now, "s1", 0.8);
        let second = classified(
            "T1",
            Classification::Hostile,
            TrackType::Aircraft,
            220.0,
            now + Duration::seconds(2),
            "s2",
            0.7,
        );

        c.correlate(&first);
        let merged = c.correlate(&second);
        assert_eq!(merged.detection_count, 2);
        assert_eq!(merged.sources, BTreeSet::from(["s1".to_owned(), "s2".to_owned()]));
        // Newer kinematics win even at lower confidence.
        assert!((merged.velocity.speed - 220.0).abs() < f64::EPSILON);
        assert!(merged.window_end > merged.window_start);
    }

    #[test]
    fn outside_window_starts_new_interval_with_monotonic_count() {
        let (_bus, mut c) = correlator();
        let now = Utc::now();
        c.correlate(&classified("T1", Classification::Unknown, TrackType::Unknown, 50.0, now, "s1", 0.6));
        let later = classified(
            "T1",
            Classification::Unknown,
            TrackType::Unknown,
            50.0,
            now + Duration::seconds(60),
            "s1",
            0.6,
        );
        let restarted = c.correlate(&later);
        assert_eq!(restarted.detection_count, 2);
        assert_eq!(restarted.window_start, later.last_updated);
    }

    #[test]
    fn concrete_classification_upgrades_unknown() {
        let (_bus, mut c) = correlator();
        let now = Utc::now();
        c.correlate(&classified("T1", Classification::Unknown, TrackType::Unknown, 500.0, now, "s1", 0.9));
        // Lower confidence, but concrete: the unknown upgrades.
        let upgraded = c.correlate(&classified(
            "T1",
            Classification::Hostile,
            TrackType::Missile,
            500.0,
            now + Duration::seconds(1),
            "s2",
            0.5,
        ));
        assert_eq!(upgraded.classification, Classification::Hostile);
        assert_eq!(upgraded.track_type, TrackType::Missile);
        assert_eq!(upgraded.threat_level, ThreatLevel::Critical);
    }

    #[test]
    fn lower_confidence_does_not_downgrade_concrete() {
        let (_bus, mut c) = correlator();
        let now = Utc::now();
        c.correlate(&classified("T1", Classification::Hostile, TrackType::Aircraft, 100.0, now, "s1", 0.9));
        let kept = c.correlate(&classified(
            "T1",
            Classification::Neutral,
            TrackType::Aircraft,
            100.0,
            now + Duration::seconds(1),
            "s2",
            0.4,
        ));
        assert_eq!(kept.classification, Classification::Hostile);
    }

    #[test]
    fn threat_is_recomputed_at_commit_time() {
        let (_bus, mut c) = correlator();
        let now = Utc::now();
        let slow = c.correlate(&classified("T1", Classification::Hostile, TrackType::Aircraft, 100.0, now, "s1", 0.9));
        assert_eq!(slow.threat_level, ThreatLevel::Medium);
        let fast = c.correlate(&classified(
            "T1",
            Classification::Hostile,
            TrackType::Aircraft,
            500.0,
            now + Duration::seconds(1),
            "s1",
            0.9,
        ));
        assert_eq!(fast.threat_level, ThreatLevel::High);
    }

    #[test]
    fn stale_entries_are_evicted() {
        let (_bus, mut c) = correlator();
        let old = Utc::now() - Duration::seconds(600);
        c.correlate(&classified("T-old", Classification::Neutral, TrackType::Vessel, 5.0, old, "s1", 0.5));
        assert_eq!(c.working_set_len(), 1);
        c.evict_stale(Utc::now());
        assert_eq!(c.working_set_len(), 0);
    }

    #[tokio::test]
    async fn publishes_on_threat_bucketed_subject() {
        let (bus, mut c) = correlator();
        let mut sub = bus.subscribe("track.correlated.critical");

        let message = BusMessage::new(
            Envelope::root("classifier-1", "classifier"),
            classified("T9", Classification::Hostile, TrackType::Missile, 700.0, Utc::now(), "s1", 0.95),
        );
        let delivery = Delivery {
            stream: "TRACKS".into(),
            consumer: "correlator".into(),
            stream_seq: 1,
            subject: "track.classified.hostile".into(),
            payload: message.to_bytes().unwrap(),
            deliver_count: 1,
        };
        c.process(&delivery).await.unwrap();

        let event = sub.next().await.unwrap();
        let outgoing: BusMessage<CorrelatedTrack> = BusMessage::from_bytes(&event.payload).unwrap();
        assert_eq!(outgoing.body.threat_level, ThreatLevel::Critical);
        assert_eq!(outgoing.envelope.correlation_id, message.envelope.correlation_id);
    }
}
