//! Background consumers owned by the API layer.
//!
//! The track-persistence consumer is what makes the store the read model:
//! a plain subscription on `track.correlated.>` (not a work queue --
//! persistence failures tolerate the stream's redelivery) upserting the
//! tracks table. Sibling tasks record raw detections for track history,
//! mirror proposal/decision/effect subjects to the push hub, prune
//! inactive tracks, and broadcast a periodic metrics frame.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aegis_bus::{BusEvent, MessageBus};
use aegis_core::{BusMessage, CorrelatedTrack, Detection};
use aegis_store::CanonicalStore;

use crate::ws::{Frame, HubHandle};

/// Interval between track prune passes.
const PRUNE_INTERVAL: Duration = Duration::from_secs(10);

/// Interval between `metrics.update` push frames.
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Settings for the background consumers.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Tracks idle longer than this are deleted.
    pub track_hard_ttl: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            track_hard_ttl: Duration::from_secs(30),
        }
    }
}

/// Spawn every background consumer. The returned handles finish once
/// `shutdown` fires.
pub fn spawn_all(
    bus: &Arc<dyn MessageBus>,
    store: &Arc<dyn CanonicalStore>,
    hub: &HubHandle,
    config: PersistenceConfig,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_track_persistence(
            Arc::clone(bus),
            Arc::clone(store),
            hub.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(run_detection_recorder(
            Arc::clone(bus),
            Arc::clone(store),
            shutdown.clone(),
        )),
        tokio::spawn(run_subject_mirror(
            Arc::clone(bus),
            hub.clone(),
            "proposal.pending.>",
            "proposal.new",
            shutdown.clone(),
        )),
        tokio::spawn(run_subject_mirror(
            Arc::clone(bus),
            hub.clone(),
            "decision.>",
            "decision.made",
            shutdown.clone(),
        )),
        tokio::spawn(run_subject_mirror(
            Arc::clone(bus),
            hub.clone(),
            "effect.>",
            "effect.executed",
            shutdown.clone(),
        )),
        tokio::spawn(run_track_pruner(
            Arc::clone(store),
            config,
            shutdown.clone(),
        )),
        tokio::spawn(run_metrics_ticker(
            Arc::clone(store),
            hub.clone(),
            shutdown.clone(),
        )),
    ]
}

/// Upsert correlated tracks into the canonical store and notify push
/// clients (`track.new` on first sight, `track.update` after).
pub async fn run_track_persistence(
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn CanonicalStore>,
    hub: HubHandle,
    shutdown: CancellationToken,
) {
    let mut subscription = bus.subscribe("track.correlated.>");
    info!("track persistence consumer started");
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => return,
            event = subscription.next() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let message: BusMessage<CorrelatedTrack> = match BusMessage::from_bytes(&event.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(subject = %event.subject, error = %e, "undecodable correlated track");
                continue;
            }
        };

        let track = &message.body;
        let is_new = match store.get_track(&track.track_id).await {
            Ok(existing) => existing.is_none(),
            Err(e) => {
                warn!(error = %e, "track lookup failed, treating as update");
                false
            }
        };
        if let Err(e) = store.upsert_track(track).await {
            // Plain subscription: no ack to withhold. The next update for
            // this track heals the gap.
            warn!(track_id = %track.track_id, error = %e, "track upsert failed");
            continue;
        }
        let _ = store.increment_counter("tracks_persisted", 1).await;

        let frame_type = if is_new { "track.new" } else { "track.update" };
        match serde_json::to_value(track) {
            Ok(payload) => hub.broadcast(Frame::new(
                frame_type,
                payload,
                Some(message.envelope.correlation_id.clone()),
            )),
            Err(e) => warn!(error = %e, "track frame serialization failed"),
        }
        debug!(track_id = %track.track_id, new = is_new, "track persisted");
    }
}

/// Append raw detections to the per-track history table.
pub async fn run_detection_recorder(
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn CanonicalStore>,
    shutdown: CancellationToken,
) {
    let mut subscription = bus.subscribe("detect.>");
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => return,
            event = subscription.next() => match event {
                Some(event) => event,
                None => return,
            },
        };
        let message: BusMessage<Detection> = match BusMessage::from_bytes(&event.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(subject = %event.subject, error = %e, "undecodable detection");
                continue;
            }
        };
        if let Err(e) = store.insert_detection(&message.body).await {
            warn!(track_id = %message.body.track_id, error = %e, "detection insert failed");
        }
    }
}

/// Mirror a bus subject filter to push clients as `frame_type` frames.
pub async fn run_subject_mirror(
    bus: Arc<dyn MessageBus>,
    hub: HubHandle,
    filter: &'static str,
    frame_type: &'static str,
    shutdown: CancellationToken,
) {
    let mut subscription = bus.subscribe(filter);
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => return,
            event = subscription.next() => match event {
                Some(event) => event,
                None => return,
            },
        };
        mirror_event(&hub, frame_type, &event);
    }
}

fn mirror_event(hub: &HubHandle, frame_type: &str, event: &BusEvent) {
    match serde_json::from_slice::<serde_json::Value>(&event.payload) {
        Ok(payload) => {
            let correlation_id = payload
                .get("envelope")
                .and_then(|e| e.get("correlation_id"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned);
            hub.broadcast(Frame::new(frame_type, payload, correlation_id));
        }
        Err(e) => warn!(subject = %event.subject, error = %e, "unmirrorable payload"),
    }
}

/// Delete tracks idle past the hard cutoff.
pub async fn run_track_pruner(
    store: Arc<dyn CanonicalStore>,
    config: PersistenceConfig,
    shutdown: CancellationToken,
) {
    let mut timer = tokio::time::interval(PRUNE_INTERVAL);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = timer.tick() => {}
        }
        let cutoff = Utc::now()
            - chrono::Duration::from_std(config.track_hard_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        match store.prune_tracks(cutoff).await {
            Ok(0) => {}
            Ok(n) => debug!(removed = n, "pruned inactive tracks"),
            Err(e) => warn!(error = %e, "track prune failed"),
        }
    }
}

/// Broadcast a periodic `metrics.update` frame with the store counters.
pub async fn run_metrics_ticker(
    store: Arc<dyn CanonicalStore>,
    hub: HubHandle,
    shutdown: CancellationToken,
) {
    let mut timer = tokio::time::interval(METRICS_INTERVAL);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = timer.tick() => {}
        }
        match store.counters().await {
            Ok(counters) => {
                if let Ok(payload) = serde_json::to_value(&counters) {
                    hub.broadcast(Frame::new("metrics.update", payload, None));
                }
            }
            Err(e) => warn!(error = %e, "counter snapshot failed"),
        }
    }
}
