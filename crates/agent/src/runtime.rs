//! The pull-consumer loop shared by every consuming stage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use aegis_bus::{ConsumerConfig, Delivery, MessageBus, StreamConfig};
use aegis_core::{AgentId, PipelineError};

use crate::backoff::Backoff;
use crate::metrics::AgentMetrics;

/// Maximum deliveries pulled per fetch.
const MAX_BATCH: usize = 10;

/// Bounded wait for a fetch with nothing ready.
const FETCH_WAIT: Duration = Duration::from_millis(500);

/// A stage's message handler.
///
/// `process` owns decode: it receives the raw delivery and returns an error
/// from the shared taxonomy. Retryable errors (decode, transient) are
/// nacked for redelivery; validation and conflict errors are recorded and
/// acked, since retrying them cannot succeed.
#[async_trait]
pub trait Processor: Send {
    /// Handle one delivery.
    async fn process(&mut self, delivery: &Delivery) -> Result<(), PipelineError>;
}

/// The consumer loop: bootstraps the stream and durable consumer, then
/// pulls batches until cancelled.
pub struct ConsumerLoop {
    id: AgentId,
    kind: &'static str,
    bus: Arc<dyn MessageBus>,
    stream: StreamConfig,
    consumer: ConsumerConfig,
    metrics: Arc<AgentMetrics>,
    shutdown: CancellationToken,
}

impl ConsumerLoop {
    /// Create a loop for one agent over one stream/consumer pair.
    pub fn new(
        id: AgentId,
        kind: &'static str,
        bus: Arc<dyn MessageBus>,
        stream: StreamConfig,
        consumer: ConsumerConfig,
        metrics: Arc<AgentMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            kind,
            bus,
            stream,
            consumer,
            metrics,
            shutdown,
        }
    }

    /// Ensure the stream and consumer exist (create-if-missing).
    pub async fn bootstrap(&self) -> Result<(), PipelineError> {
        self.bus
            .ensure_stream(self.stream.clone())
            .await
            .map_err(|e| PipelineError::Fatal(format!("stream bootstrap: {e}")))?;
        self.bus
            .ensure_consumer(&self.stream.name, self.consumer.clone())
            .await
            .map_err(|e| PipelineError::Fatal(format!("consumer bootstrap: {e}")))?;
        Ok(())
    }

    /// Run until the shutdown token fires. The current batch is always
    /// drained before returning, so inflight deliveries are acked or
    /// nacked, never abandoned.
    pub async fn run<P: Processor>(&self, processor: &mut P) -> Result<(), PipelineError> {
        self.bootstrap().await?;
        info!(
            agent_id = %self.id,
            kind = self.kind,
            stream = %self.stream.name,
            consumer = %self.consumer.name,
            "agent consumer loop started"
        );

        let mut backoff = Backoff::transport();
        loop {
            if self.shutdown.is_cancelled() {
                info!(agent_id = %self.id, kind = self.kind, "agent consumer loop stopped");
                return Ok(());
            }

            let batch = tokio::select! {
                () = self.shutdown.cancelled() => continue,
                result = self.bus.fetch(
                    &self.stream.name,
                    &self.consumer.name,
                    MAX_BATCH,
                    FETCH_WAIT,
                ) => match result {
                    Ok(batch) => {
                        backoff.reset();
                        batch
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(
                            agent_id = %self.id,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "bus fetch failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                },
            };

            for delivery in batch {
                self.handle(processor, &delivery).await?;
            }
        }
    }

    async fn handle<P: Processor>(
        &self,
        processor: &mut P,
        delivery: &Delivery,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        let result = processor.process(delivery).await;
        let latency_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

        match result {
            Ok(()) => {
                self.metrics.record_processed(latency_us, true);
                if let Err(e) = self.bus.ack(delivery).await {
                    warn!(agent_id = %self.id, error = %e, "ack failed");
                }
            }
            Err(PipelineError::Fatal(msg)) => {
                error!(agent_id = %self.id, error = %msg, "fatal error, stopping agent");
                return Err(PipelineError::Fatal(msg));
            }
            Err(e) if e.is_retryable() => {
                self.metrics.record_error(e.class());
                self.metrics.record_processed(latency_us, false);
                debug!(
                    agent_id = %self.id,
                    subject = %delivery.subject,
                    deliver_count = delivery.deliver_count,
                    error = %e,
                    "nacking for redelivery"
                );
                if let Err(e) = self.bus.nack(delivery).await {
                    warn!(agent_id = %self.id, error = %e, "nack failed");
                }
            }
            Err(e) => {
                // Validation and conflict errors are terminal for this
                // message: recorded, then acked so the bus moves on.
                self.metrics.record_error(e.class());
                self.metrics.record_processed(latency_us, true);
                debug!(
                    agent_id = %self.id,
                    subject = %delivery.subject,
                    error = %e,
                    "non-retryable error, acking"
                );
                if let Err(e) = self.bus.ack(delivery).await {
                    warn!(agent_id = %self.id, error = %e, "ack failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_bus::InMemoryBus;

    struct Collector {
        seen: Vec<String>,
        fail_first_with: Option<PipelineError>,
    }

    #[async_trait]
    impl Processor for Collector {
        async fn process(&mut self, delivery: &Delivery) -> Result<(), PipelineError> {
            if let Some(err) = self.fail_first_with.take() {
                return Err(err);
            }
            self.seen
                .push(String::from_utf8_lossy(&delivery.payload).into_owned());
            Ok(())
        }
    }

    fn setup() -> (Arc<InMemoryBus>, ConsumerLoop, Arc<AgentMetrics>, CancellationToken) {
        let bus = Arc::new(InMemoryBus::new());
        let metrics = Arc::new(AgentMetrics::default());
        let shutdown = CancellationToken::new();
        let consumer_loop = ConsumerLoop::new(
            AgentId::new("classifier-1"),
            "classifier",
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            StreamConfig::new("DETECTIONS", vec!["detect.>".into()]),
            ConsumerConfig::new("classifier", "detect.>")
                .with_ack_wait(Duration::from_millis(50)),
            Arc::clone(&metrics),
            shutdown.clone(),
        );
        (bus, consumer_loop, metrics, shutdown)
    }

    #[tokio::test]
    async fn processes_and_acks_messages() {
        let (bus, consumer_loop, metrics, shutdown) = setup();
        consumer_loop.bootstrap().await.unwrap();
        bus.publish("detect.s1.radar", b"a".to_vec()).await.unwrap();
        bus.publish("detect.s1.radar", b"b".to_vec()).await.unwrap();

        let mut processor = Collector {
            seen: vec![],
            fail_first_with: None,
        };
        let handle = tokio::spawn(async move {
            consumer_loop.run(&mut processor).await.unwrap();
            processor.seen
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        let seen = handle.await.unwrap();

        assert_eq!(seen, vec!["a", "b"]);
        let snap = metrics.snapshot();
        assert_eq!(snap.acked, 2);
        assert_eq!(snap.nacked, 0);
    }

    #[tokio::test]
    async fn transient_error_nacks_and_redelivers() {
        let (bus, consumer_loop, metrics, shutdown) = setup();
        consumer_loop.bootstrap().await.unwrap();
        bus.publish("detect.s1.radar", b"retry-me".to_vec()).await.unwrap();

        let mut processor = Collector {
            seen: vec![],
            fail_first_with: Some(PipelineError::Transient("store down".into())),
        };
        let handle = tokio::spawn(async move {
            consumer_loop.run(&mut processor).await.unwrap();
            processor.seen
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        let seen = handle.await.unwrap();

        // First delivery failed, redelivery succeeded.
        assert_eq!(seen, vec!["retry-me"]);
        let snap = metrics.snapshot();
        assert_eq!(snap.nacked, 1);
        assert_eq!(snap.acked, 1);
        assert_eq!(snap.transient_errors, 1);
    }

    #[tokio::test]
    async fn validation_error_acks_without_retry() {
        let (bus, consumer_loop, metrics, shutdown) = setup();
        consumer_loop.bootstrap().await.unwrap();
        bus.publish("detect.s1.radar", b"bad".to_vec()).await.unwrap();

        let mut processor = Collector {
            seen: vec![],
            fail_first_with: Some(PipelineError::Validation("denied".into())),
        };
        let handle = tokio::spawn(async move {
            consumer_loop.run(&mut processor).await.unwrap();
            processor.seen
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        let seen = handle.await.unwrap();

        // The message was not redelivered.
        assert!(seen.is_empty());
        let snap = metrics.snapshot();
        assert_eq!(snap.validation_errors, 1);
        assert_eq!(snap.acked, 1);
    }

    #[tokio::test]
    async fn fatal_error_stops_the_loop() {
        let (bus, consumer_loop, _metrics, _shutdown) = setup();
        consumer_loop.bootstrap().await.unwrap();
        bus.publish("detect.s1.radar", b"x".to_vec()).await.unwrap();

        let mut processor = Collector {
            seen: vec![],
            fail_first_with: Some(PipelineError::Fatal("cannot start".into())),
        };
        let err = consumer_loop.run(&mut processor).await.unwrap_err();
        assert!(matches!(err, PipelineError::Fatal(_)));
    }
}
