//! The in-process bus implementation.
//!
//! One [`StreamEntry`] per stream, each a mutex-guarded state plus a
//! [`Notify`] used to wake pull waiters on publish and nack. All critical
//! sections are short and never held across an await.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, trace};

use crate::bus::{BusEvent, BusSubscription, Delivery, MessageBus};
use crate::consumer::ConsumerConfig;
use crate::error::BusError;
use crate::stream::{DiscardPolicy, RetentionPolicy, StreamConfig};

/// Capacity of the plain-subscription fan-out channel.
const FANOUT_CAPACITY: usize = 1024;

/// Upper bound on a single wait inside `fetch`, so a missed wakeup costs
/// bounded latency rather than the full `max_wait`.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct StoredMessage {
    subject: String,
    payload: Vec<u8>,
    stored_at: Instant,
}

struct PendingDelivery {
    deliver_count: u32,
    redeliver_at: Instant,
}

struct ConsumerState {
    config: ConsumerConfig,
    /// Next stream sequence this consumer has not yet seen.
    cursor: u64,
    /// Delivered but unacknowledged messages, keyed by stream sequence.
    pending: HashMap<u64, PendingDelivery>,
}

struct StreamState {
    config: StreamConfig,
    /// Stored messages ordered by stream sequence.
    messages: BTreeMap<u64, StoredMessage>,
    next_seq: u64,
    consumers: HashMap<String, ConsumerState>,
}

struct StreamEntry {
    state: Mutex<StreamState>,
    notify: Notify,
}

/// In-memory implementation of [`MessageBus`].
///
/// Cheap to clone via [`Arc`]; every agent and the server share one
/// instance in a single-process deployment, which is exactly the embedded
/// broker topology the pipeline was designed around.
pub struct InMemoryBus {
    streams: DashMap<String, Arc<StreamEntry>>,
    fanout: broadcast::Sender<BusEvent>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    /// Create an empty bus with no streams.
    #[must_use]
    pub fn new() -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            streams: DashMap::new(),
            fanout,
        }
    }

    fn entry(&self, stream: &str) -> Result<Arc<StreamEntry>, BusError> {
        self.streams
            .get(stream)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| BusError::StreamNotFound(stream.to_owned()))
    }

    /// Evict messages past the stream's age cap, and forget pending
    /// deliveries whose message is gone.
    fn prune_expired(state: &mut StreamState, now: Instant) {
        let max_age = state.config.max_age;
        let expired: Vec<u64> = state
            .messages
            .iter()
            .take_while(|(_, m)| now.duration_since(m.stored_at) > max_age)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in expired {
            state.messages.remove(&seq);
            for consumer in state.consumers.values_mut() {
                consumer.pending.remove(&seq);
            }
        }
    }

    fn enforce_caps(state: &mut StreamState, subject: &str) -> Result<(), BusError> {
        let per_subject = state.config.max_msgs_per_subject;
        if per_subject > 0 {
            let count = state
                .messages
                .values()
                .filter(|m| m.subject == subject)
                .count();
            if count >= per_subject {
                let oldest = state
                    .messages
                    .iter()
                    .find(|(_, m)| m.subject == subject)
                    .map(|(&seq, _)| seq);
                if let Some(seq) = oldest {
                    state.messages.remove(&seq);
                }
            }
        }

        let max_msgs = state.config.max_msgs;
        if max_msgs > 0 && state.messages.len() >= max_msgs {
            match state.config.discard {
                DiscardPolicy::Old => {
                    if let Some((&seq, _)) = state.messages.iter().next() {
                        state.messages.remove(&seq);
                    }
                }
                DiscardPolicy::New => {
                    return Err(BusError::Publish(format!(
                        "stream {} is full ({max_msgs} messages)",
                        state.config.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// One locked pass of the fetch loop: collect due redeliveries and new
    /// deliveries, and report how long to wait if nothing was ready.
    #[allow(clippy::too_many_lines)]
    fn collect_deliveries(
        stream: &str,
        state: &mut StreamState,
        consumer_name: &str,
        batch: usize,
        now: Instant,
    ) -> Result<(Vec<Delivery>, Option<Instant>), BusError> {
        Self::prune_expired(state, now);

        let retention = state.config.retention;
        // Split borrows: redelivery exhaustion on a work queue deletes the
        // message itself, so gather seqs first.
        let consumer = state
            .consumers
            .get_mut(consumer_name)
            .ok_or_else(|| BusError::ConsumerNotFound(consumer_name.to_owned()))?;

        let mut deliveries = Vec::new();
        let mut exhausted: Vec<u64> = Vec::new();
        let mut due: Vec<u64> = consumer
            .pending
            .iter()
            .filter(|(_, p)| p.redeliver_at <= now)
            .map(|(&seq, _)| seq)
            .collect();
        due.sort_unstable();

        for seq in due {
            if deliveries.len() >= batch {
                break;
            }
            let Some(p) = consumer.pending.get_mut(&seq) else {
                continue;
            };
            if p.deliver_count >= consumer.config.max_deliver {
                // Delivery budget spent: stop tracking. Poison messages on a
                // work queue are removed so they cannot wedge the stream.
                consumer.pending.remove(&seq);
                exhausted.push(seq);
                continue;
            }
            p.deliver_count += 1;
            p.redeliver_at = now + consumer.config.ack_wait;
            let deliver_count = p.deliver_count;
            let Some(msg) = state.messages.get(&seq) else {
                consumer.pending.remove(&seq);
                continue;
            };
            deliveries.push(Delivery {
                stream: stream.to_owned(),
                consumer: consumer_name.to_owned(),
                stream_seq: seq,
                subject: msg.subject.clone(),
                payload: msg.payload.clone(),
                deliver_count,
            });
        }

        // New deliveries, in publication order, bounded by the batch size
        // and the consumer's outstanding-delivery cap.
        let consumer = state
            .consumers
            .get_mut(consumer_name)
            .ok_or_else(|| BusError::ConsumerNotFound(consumer_name.to_owned()))?;
        let filter = consumer.config.filter_subject.clone();
        let ack_wait = consumer.config.ack_wait;
        let max_ack_pending = consumer.config.max_ack_pending;
        let mut cursor = consumer.cursor;

        let candidates: Vec<(u64, String, Vec<u8>)> = state
            .messages
            .range(cursor..)
            .filter(|(_, m)| aegis_core::subject_matches(&filter, &m.subject))
            .map(|(&seq, m)| (seq, m.subject.clone(), m.payload.clone()))
            .collect();

        let consumer = state
            .consumers
            .get_mut(consumer_name)
            .ok_or_else(|| BusError::ConsumerNotFound(consumer_name.to_owned()))?;
        for (seq, subject, payload) in candidates {
            if deliveries.len() >= batch || consumer.pending.len() >= max_ack_pending {
                break;
            }
            consumer.pending.insert(
                seq,
                PendingDelivery {
                    deliver_count: 1,
                    redeliver_at: now + ack_wait,
                },
            );
            cursor = seq + 1;
            deliveries.push(Delivery {
                stream: stream.to_owned(),
                consumer: consumer_name.to_owned(),
                stream_seq: seq,
                subject,
                payload,
                deliver_count: 1,
            });
        }
        if cursor > consumer.cursor {
            consumer.cursor = cursor;
        }

        let next_redelivery = consumer
            .pending
            .values()
            .map(|p| p.redeliver_at)
            .min();

        if retention == RetentionPolicy::WorkQueue {
            for seq in &exhausted {
                state.messages.remove(seq);
            }
        }
        if !exhausted.is_empty() {
            debug!(
                stream,
                consumer = consumer_name,
                count = exhausted.len(),
                "dropped deliveries after max-deliver exhaustion"
            );
        }

        Ok((deliveries, next_redelivery))
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn ensure_stream(&self, config: StreamConfig) -> Result<(), BusError> {
        if config.subjects.is_empty() {
            return Err(BusError::Config(format!(
                "stream {} has no subject filters",
                config.name
            )));
        }
        self.streams
            .entry(config.name.clone())
            .or_insert_with(|| {
                Arc::new(StreamEntry {
                    state: Mutex::new(StreamState {
                        config,
                        messages: BTreeMap::new(),
                        next_seq: 1,
                        consumers: HashMap::new(),
                    }),
                    notify: Notify::new(),
                })
            });
        Ok(())
    }

    async fn ensure_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<(), BusError> {
        let entry = self.entry(stream)?;
        let mut state = entry.state.lock();
        if state.config.retention == RetentionPolicy::WorkQueue
            && state.consumers.keys().any(|name| name != &config.name)
        {
            return Err(BusError::Config(format!(
                "work-queue stream {stream} already has a consumer"
            )));
        }
        state.consumers.entry(config.name.clone()).or_insert_with(|| {
            let cursor = 1;
            ConsumerState {
                config,
                cursor,
                pending: HashMap::new(),
            }
        });
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let now = Instant::now();
        for entry_ref in &self.streams {
            let entry = entry_ref.value();
            let mut state = entry.state.lock();
            if !state.config.captures(subject) {
                continue;
            }
            Self::prune_expired(&mut state, now);
            Self::enforce_caps(&mut state, subject)?;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.messages.insert(
                seq,
                StoredMessage {
                    subject: subject.to_owned(),
                    payload: payload.clone(),
                    stored_at: now,
                },
            );
            drop(state);
            entry.notify.notify_waiters();
        }

        // Plain subscribers see every publish, stream-captured or not.
        // A send error only means nobody is listening.
        let _ = self.fanout.send(BusEvent {
            subject: subject.to_owned(),
            payload,
        });
        trace!(subject, "published");
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        max_wait: Duration,
    ) -> Result<Vec<Delivery>, BusError> {
        let entry = self.entry(stream)?;
        let deadline = Instant::now() + max_wait;

        loop {
            let now = Instant::now();
            let (deliveries, next_redelivery) = {
                let mut state = entry.state.lock();
                Self::collect_deliveries(stream, &mut state, consumer, batch, now)?
            };
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            if now >= deadline {
                return Ok(Vec::new());
            }

            let mut wait = deadline.saturating_duration_since(now).min(MAX_POLL_INTERVAL);
            if let Some(at) = next_redelivery {
                wait = wait.min(at.saturating_duration_since(now).max(Duration::from_millis(1)));
            }
            tokio::select! {
                () = entry.notify.notified() => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let entry = self.entry(&delivery.stream)?;
        let mut state = entry.state.lock();
        let retention = state.config.retention;
        let consumer = state
            .consumers
            .get_mut(&delivery.consumer)
            .ok_or_else(|| BusError::ConsumerNotFound(delivery.consumer.clone()))?;
        // Acks are idempotent: a redelivered-then-double-acked message is
        // simply no longer tracked.
        if consumer.pending.remove(&delivery.stream_seq).is_some()
            && retention == RetentionPolicy::WorkQueue
        {
            state.messages.remove(&delivery.stream_seq);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let entry = self.entry(&delivery.stream)?;
        {
            let mut state = entry.state.lock();
            let consumer = state
                .consumers
                .get_mut(&delivery.consumer)
                .ok_or_else(|| BusError::ConsumerNotFound(delivery.consumer.clone()))?;
            if let Some(p) = consumer.pending.get_mut(&delivery.stream_seq) {
                p.redeliver_at = Instant::now();
            }
        }
        entry.notify.notify_waiters();
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> BusSubscription {
        BusSubscription::new(filter, self.fanout.subscribe())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detections_stream() -> StreamConfig {
        StreamConfig::new("DETECTIONS", vec!["detect.>".into()])
    }

    fn proposals_stream() -> StreamConfig {
        StreamConfig::new("PROPOSALS", vec!["proposal.>".into()]).work_queue()
    }

    async fn bus_with_consumer(
        stream: StreamConfig,
        consumer: ConsumerConfig,
    ) -> (InMemoryBus, String, String) {
        let bus = InMemoryBus::new();
        let stream_name = stream.name.clone();
        let consumer_name = consumer.name.clone();
        bus.ensure_stream(stream).await.unwrap();
        bus.ensure_consumer(&stream_name, consumer).await.unwrap();
        (bus, stream_name, consumer_name)
    }

    #[tokio::test]
    async fn publish_fetch_ack() {
        let (bus, stream, consumer) = bus_with_consumer(
            detections_stream(),
            ConsumerConfig::new("classifier", "detect.>"),
        )
        .await;

        bus.publish("detect.s1.radar", b"one".to_vec()).await.unwrap();
        bus.publish("detect.s2.radar", b"two".to_vec()).await.unwrap();

        let batch = bus
            .fetch(&stream, &consumer, 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, b"one");
        assert_eq!(batch[0].deliver_count, 1);

        for d in &batch {
            bus.ack(d).await.unwrap();
        }

        // Nothing left.
        let empty = bus
            .fetch(&stream, &consumer, 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn nack_triggers_redelivery_with_incremented_count() {
        let (bus, stream, consumer) = bus_with_consumer(
            detections_stream(),
            ConsumerConfig::new("classifier", "detect.>"),
        )
        .await;

        bus.publish("detect.s1.radar", b"m".to_vec()).await.unwrap();
        let first = bus
            .fetch(&stream, &consumer, 1, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(first[0].deliver_count, 1);
        bus.nack(&first[0]).await.unwrap();

        let second = bus
            .fetch(&stream, &consumer, 1, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].deliver_count, 2);
        assert_eq!(second[0].stream_seq, first[0].stream_seq);
    }

    #[tokio::test]
    async fn ack_wait_expiry_redelivers() {
        let (bus, stream, consumer) = bus_with_consumer(
            detections_stream(),
            ConsumerConfig::new("classifier", "detect.>")
                .with_ack_wait(Duration::from_millis(30)),
        )
        .await;

        bus.publish("detect.s1.radar", b"m".to_vec()).await.unwrap();
        let first = bus
            .fetch(&stream, &consumer, 1, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        // Never acked; after the ack-wait the message comes back.
        let second = bus
            .fetch(&stream, &consumer, 1, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].deliver_count, 2);
    }

    #[tokio::test]
    async fn max_deliver_bounds_redelivery() {
        let (bus, stream, consumer) = bus_with_consumer(
            detections_stream(),
            ConsumerConfig::new("classifier", "detect.>")
                .with_ack_wait(Duration::from_millis(10))
                .with_max_deliver(2),
        )
        .await;

        bus.publish("detect.s1.radar", b"poison".to_vec()).await.unwrap();
        let d1 = bus
            .fetch(&stream, &consumer, 1, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(d1[0].deliver_count, 1);
        let d2 = bus
            .fetch(&stream, &consumer, 1, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(d2[0].deliver_count, 2);
        // Budget exhausted: no third delivery.
        let d3 = bus
            .fetch(&stream, &consumer, 1, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(d3.is_empty());
    }

    #[tokio::test]
    async fn work_queue_removes_acked_messages() {
        let (bus, stream, consumer) = bus_with_consumer(
            proposals_stream(),
            ConsumerConfig::new("authorizer", "proposal.>").with_max_deliver(1),
        )
        .await;

        bus.publish("proposal.pending.high", b"p".to_vec()).await.unwrap();
        let batch = bus
            .fetch(&stream, &consumer, 1, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        bus.ack(&batch[0]).await.unwrap();

        let state = bus.streams.get(&stream).unwrap();
        assert!(state.state.lock().messages.is_empty());
    }

    #[tokio::test]
    async fn work_queue_rejects_second_consumer() {
        let (bus, stream, _) = bus_with_consumer(
            proposals_stream(),
            ConsumerConfig::new("authorizer", "proposal.>"),
        )
        .await;
        let err = bus
            .ensure_consumer(&stream, ConsumerConfig::new("other", "proposal.>"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
        // Re-ensuring the same consumer is fine.
        bus.ensure_consumer(&stream, ConsumerConfig::new("authorizer", "proposal.>"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn filter_subject_limits_deliveries() {
        let (bus, stream, consumer) = bus_with_consumer(
            StreamConfig::new("DECISIONS", vec!["decision.>".into()]),
            ConsumerConfig::new("effector", "decision.approved.>"),
        )
        .await;

        bus.publish("decision.approved.engage", b"a".to_vec()).await.unwrap();
        bus.publish("decision.denied.engage", b"d".to_vec()).await.unwrap();

        let batch = bus
            .fetch(&stream, &consumer, 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject, "decision.approved.engage");
    }

    #[tokio::test]
    async fn max_msgs_discards_oldest() {
        let bus = InMemoryBus::new();
        bus.ensure_stream(detections_stream().with_max_msgs(2))
            .await
            .unwrap();
        bus.ensure_consumer("DETECTIONS", ConsumerConfig::new("c", "detect.>"))
            .await
            .unwrap();

        for i in 0..3 {
            bus.publish("detect.s1.radar", vec![i]).await.unwrap();
        }
        let batch = bus
            .fetch("DETECTIONS", "c", 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, vec![1]);
        assert_eq!(batch[1].payload, vec![2]);
    }

    #[tokio::test]
    async fn per_subject_cap_evicts_only_that_subject() {
        let bus = InMemoryBus::new();
        bus.ensure_stream(detections_stream().with_max_msgs_per_subject(1))
            .await
            .unwrap();
        bus.ensure_consumer("DETECTIONS", ConsumerConfig::new("c", "detect.>"))
            .await
            .unwrap();

        bus.publish("detect.s1.radar", b"s1-old".to_vec()).await.unwrap();
        bus.publish("detect.s2.radar", b"s2".to_vec()).await.unwrap();
        bus.publish("detect.s1.radar", b"s1-new".to_vec()).await.unwrap();

        let batch = bus
            .fetch("DETECTIONS", "c", 10, Duration::from_millis(100))
            .await
            .unwrap();
        let payloads: Vec<&[u8]> = batch.iter().map(|d| d.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"s2".as_slice(), b"s1-new".as_slice()]);
    }

    #[tokio::test]
    async fn fetch_wakes_on_publish() {
        let (bus, stream, consumer) = bus_with_consumer(
            detections_stream(),
            ConsumerConfig::new("classifier", "detect.>"),
        )
        .await;
        let bus = Arc::new(bus);

        let fetcher = {
            let bus = Arc::clone(&bus);
            let stream = stream.clone();
            tokio::spawn(async move {
                bus.fetch(&stream, &consumer, 1, Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("detect.s1.radar", b"late".to_vec()).await.unwrap();

        let batch = fetcher.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"late");
    }

    #[tokio::test]
    async fn plain_subscription_filters_and_does_not_consume() {
        let (bus, stream, consumer) = bus_with_consumer(
            StreamConfig::new("TRACKS", vec!["track.>".into()]),
            ConsumerConfig::new("planner", "track.correlated.>"),
        )
        .await;

        let mut sub = bus.subscribe("track.correlated.>");
        bus.publish("track.classified.hostile", b"c".to_vec()).await.unwrap();
        bus.publish("track.correlated.critical", b"x".to_vec()).await.unwrap();

        let event = sub.next().await.unwrap();
        assert_eq!(event.subject, "track.correlated.critical");

        // The durable consumer still sees the stream contents.
        let batch = bus
            .fetch(&stream, &consumer, 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn age_cap_expires_messages() {
        let bus = InMemoryBus::new();
        bus.ensure_stream(
            detections_stream().with_max_age(Duration::from_millis(20)),
        )
        .await
        .unwrap();
        bus.ensure_consumer("DETECTIONS", ConsumerConfig::new("c", "detect.>"))
            .await
            .unwrap();

        bus.publish("detect.s1.radar", b"old".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        bus.publish("detect.s1.radar", b"fresh".to_vec()).await.unwrap();

        let batch = bus
            .fetch("DETECTIONS", "c", 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"fresh");
    }

    #[tokio::test]
    async fn unknown_stream_and_consumer_error() {
        let bus = InMemoryBus::new();
        assert!(matches!(
            bus.fetch("NOPE", "c", 1, Duration::from_millis(10)).await,
            Err(BusError::StreamNotFound(_))
        ));
        bus.ensure_stream(detections_stream()).await.unwrap();
        assert!(matches!(
            bus.fetch("DETECTIONS", "ghost", 1, Duration::from_millis(10)).await,
            Err(BusError::ConsumerNotFound(_))
        ));
    }
}
