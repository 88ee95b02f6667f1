//! The classifier: enriches raw detections with classification and type.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use aegis_agent::{AgentMetrics, Processor};
use aegis_bus::{Delivery, MessageBus};
use aegis_core::{
    BusMessage, Classification, ClassifiedTrack, Detection, Envelope, PipelineError, SigningKey,
    Subject, TrackType,
};

/// The classifier stage. Consumes `detect.>`, emits
/// `track.classified.<classification>` with the correlation id forwarded.
pub struct Classifier {
    agent_id: String,
    bus: Arc<dyn MessageBus>,
    key: Option<SigningKey>,
    metrics: Arc<AgentMetrics>,
    paused: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Classifier {
    /// Create a classifier.
    pub fn new(
        agent_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        key: Option<SigningKey>,
        metrics: Arc<AgentMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
            key,
            metrics,
            paused: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    /// The pause flag: while set, processing blocks without dropping the
    /// durable consumer's state.
    #[must_use]
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.paused)
    }

    /// Map a detection to a classified track. Hints win; a missing hint
    /// maps deterministically to `unknown`.
    fn classify(detection: &Detection) -> (Classification, TrackType) {
        (
            Classification::from_hint(detection.classification_hint.as_deref()),
            TrackType::from_hint(detection.type_hint.as_deref()),
        )
    }
}

#[async_trait]
impl Processor for Classifier {
    async fn process(&mut self, delivery: &Delivery) -> Result<(), PipelineError> {
        // Paused: hold the delivery rather than consuming it. The consumer
        // state survives; ack-wait redelivery is harmless because
        // classification is stateless.
        while self.paused.load(Ordering::Relaxed) {
            if self.shutdown.is_cancelled() {
                return Err(PipelineError::Transient("shutting down while paused".into()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let message: BusMessage<Detection> = BusMessage::from_bytes(&delivery.payload)?;

        // With a shared key configured, unverifiable detections are
        // recorded and dropped rather than enriched.
        if let Some(ref key) = self.key
            && !message.verify(key)?
        {
            return Err(PipelineError::Validation(format!(
                "detection from {} failed signature verification",
                message.envelope.source
            )));
        }

        let detection = &message.body;
        let (classification, track_type) = Self::classify(detection);

        let track = ClassifiedTrack {
            track_id: detection.track_id.clone(),
            classification,
            track_type,
            position: detection.position,
            velocity: detection.velocity,
            confidence: detection.confidence,
            detection_count: 1,
            first_seen: detection.observed_at,
            last_updated: detection.observed_at,
            sources: BTreeSet::from([detection.sensor_id.clone()]),
        };

        let envelope = Envelope::child_of(&message.envelope, &self.agent_id, "classifier");
        let mut outgoing = BusMessage::new(envelope, track);
        if let Some(ref key) = self.key {
            outgoing.sign(key)?;
        }

        let subject = Subject::classified(classification);
        self.bus
            .publish(&subject, outgoing.to_bytes()?)
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;
        self.metrics.record_published();
        debug!(
            track_id = %outgoing.body.track_id,
            correlation_id = %outgoing.envelope.correlation_id,
            subject = %subject,
            "detection classified"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_bus::InMemoryBus;
    use aegis_core::{GeoPosition, TrackId, Velocity};
    use chrono::Utc;

    fn detection(hint: Option<&str>, type_hint: Option<&str>) -> BusMessage<Detection> {
        BusMessage::new(
            Envelope::root("radar-1", "sensor"),
            Detection {
                track_id: TrackId::new("T1"),
                type_hint: type_hint.map(str::to_owned),
                classification_hint: hint.map(str::to_owned),
                position: GeoPosition { lat: 10.0, lon: 20.0, alt: 1000.0 },
                velocity: Velocity { speed: 600.0, heading: 90.0 },
                confidence: 0.9,
                sensor_id: "radar-1".into(),
                sensor_type: "radar".into(),
                observed_at: Utc::now(),
            },
        )
    }

    fn delivery(message: &BusMessage<Detection>) -> Delivery {
        Delivery {
            stream: "DETECTIONS".into(),
            consumer: "classifier".into(),
            stream_seq: 1,
            subject: "detect.radar-1.radar".into(),
            payload: message.to_bytes().unwrap(),
            deliver_count: 1,
        }
    }

    #[tokio::test]
    async fn forwards_correlation_id_and_routes_by_classification() {
        let bus = Arc::new(InMemoryBus::new());
        let mut classifier = Classifier::new(
            "classifier-1",
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            None,
            Arc::new(AgentMetrics::default()),
            CancellationToken::new(),
        );

        let mut sub = bus.subscribe("track.classified.>");
        let incoming = detection(Some("hostile"), Some("missile"));
        classifier.process(&delivery(&incoming)).await.unwrap();

        let event = sub.next().await.unwrap();
        assert_eq!(event.subject, "track.classified.hostile");
        let outgoing: BusMessage<ClassifiedTrack> =
            BusMessage::from_bytes(&event.payload).unwrap();
        assert_eq!(outgoing.envelope.correlation_id, incoming.envelope.correlation_id);
        assert_eq!(outgoing.envelope.causation_id, incoming.envelope.message_id);
        assert_eq!(outgoing.body.classification, Classification::Hostile);
        assert_eq!(outgoing.body.track_type, TrackType::Missile);
        assert_eq!(outgoing.body.detection_count, 1);
    }

    #[tokio::test]
    async fn missing_hints_map_to_unknown() {
        let bus = Arc::new(InMemoryBus::new());
        let mut classifier = Classifier::new(
            "classifier-1",
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            None,
            Arc::new(AgentMetrics::default()),
            CancellationToken::new(),
        );
        let mut sub = bus.subscribe("track.classified.unknown");
        classifier
            .process(&delivery(&detection(None, None)))
            .await
            .unwrap();
        let event = sub.next().await.unwrap();
        let outgoing: BusMessage<ClassifiedTrack> =
            BusMessage::from_bytes(&event.payload).unwrap();
        assert_eq!(outgoing.body.classification, Classification::Unknown);
        assert_eq!(outgoing.body.track_type, TrackType::Unknown);
    }

    #[tokio::test]
    async fn unsigned_detection_is_rejected_when_key_configured() {
        let bus = Arc::new(InMemoryBus::new());
        let key = aegis_core::parse_signing_key(&"ab".repeat(32)).unwrap();
        let mut classifier = Classifier::new(
            "classifier-1",
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            Some(key.clone()),
            Arc::new(AgentMetrics::default()),
            CancellationToken::new(),
        );

        // Unsigned message: rejected.
        let unsigned = detection(Some("hostile"), None);
        let err = classifier.process(&delivery(&unsigned)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        // Properly signed message: accepted.
        let mut signed = detection(Some("hostile"), None);
        signed.sign(&key).unwrap();
        classifier.process(&delivery(&signed)).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_payload_is_a_decode_error() {
        let bus = Arc::new(InMemoryBus::new());
        let mut classifier = Classifier::new(
            "classifier-1",
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            None,
            Arc::new(AgentMetrics::default()),
            CancellationToken::new(),
        );
        let bad = Delivery {
            stream: "DETECTIONS".into(),
            consumer: "classifier".into(),
            stream_seq: 1,
            subject: "detect.x.y".into(),
            payload: b"not json".to_vec(),
            deliver_count: 1,
        };
        let err = classifier.process(&bad).await.unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }
}
