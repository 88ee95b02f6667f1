//! The WebSocket push channel at `/ws`.
//!
//! A single hub task owns the client set; every mutation (register,
//! deregister, subscription changes) arrives over its command channel, so
//! the set has exactly one writer. Fan-out never blocks: each client has a
//! bounded outbox and a full outbox drops the frame for that client only.
//! Clients may narrow what they receive with `subscribe`/`unsubscribe`
//! control messages; an empty subscription means "all". The server pings
//! every 30 seconds to surface half-open connections.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-client outbox capacity. A slower consumer than this loses frames,
/// not the hub.
pub const OUTBOX_CAPACITY: usize = 64;

/// Server keepalive interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Hub command-channel capacity.
const HUB_CAPACITY: usize = 1024;

/// A push frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Frame type: `track.update`, `track.new`, `proposal.new`,
    /// `decision.made`, `effect.executed`, `metrics.update`, `ping`,
    /// `pong`, or `error`.
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Frame payload.
    pub payload: serde_json::Value,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Correlation id of the originating bus message, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Frame {
    /// Build a frame stamped with the current time.
    #[must_use]
    pub fn new(
        frame_type: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            frame_type: frame_type.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id,
        }
    }
}

/// A control message from the client.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct TopicsPayload {
    #[serde(default)]
    topics: Vec<String>,
}

enum HubCommand {
    Register {
        id: u64,
        tx: mpsc::Sender<Frame>,
    },
    Deregister {
        id: u64,
    },
    Subscribe {
        id: u64,
        topics: Vec<String>,
    },
    Unsubscribe {
        id: u64,
        topics: Vec<String>,
    },
    Broadcast(Frame),
}

struct Client {
    tx: mpsc::Sender<Frame>,
    /// Empty set = receive everything.
    topics: HashSet<String>,
}

/// Cloneable handle used by producers (bus mirrors, API handlers, the
/// metrics ticker) and by connection tasks.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Fan a frame out to matching clients. Never blocks: if the hub's own
    /// queue is full the frame is dropped with a warning.
    pub fn broadcast(&self, frame: Frame) {
        if let Err(e) = self.tx.try_send(HubCommand::Broadcast(frame)) {
            warn!(error = %e, "push hub queue full, dropping frame");
        }
    }

    async fn register(&self, id: u64, tx: mpsc::Sender<Frame>) {
        let _ = self.tx.send(HubCommand::Register { id, tx }).await;
    }

    async fn deregister(&self, id: u64) {
        let _ = self.tx.send(HubCommand::Deregister { id }).await;
    }

    async fn subscribe(&self, id: u64, topics: Vec<String>) {
        let _ = self.tx.send(HubCommand::Subscribe { id, topics }).await;
    }

    async fn unsubscribe(&self, id: u64, topics: Vec<String>) {
        let _ = self.tx.send(HubCommand::Unsubscribe { id, topics }).await;
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Spawn the hub task. Returns the shared handle.
#[must_use]
pub fn spawn_hub() -> HubHandle {
    let (tx, mut rx) = mpsc::channel(HUB_CAPACITY);
    let handle = HubHandle {
        tx,
        next_id: Arc::new(AtomicU64::new(1)),
    };

    tokio::spawn(async move {
        let mut clients: HashMap<u64, Client> = HashMap::new();
        let mut dropped: u64 = 0;
        while let Some(command) = rx.recv().await {
            match command {
                HubCommand::Register { id, tx } => {
                    clients.insert(
                        id,
                        Client {
                            tx,
                            topics: HashSet::new(),
                        },
                    );
                    debug!(client_id = id, clients = clients.len(), "push client registered");
                }
                HubCommand::Deregister { id } => {
                    clients.remove(&id);
                    debug!(client_id = id, clients = clients.len(), "push client deregistered");
                }
                HubCommand::Subscribe { id, topics } => {
                    if let Some(client) = clients.get_mut(&id) {
                        client.topics.extend(topics);
                    }
                }
                HubCommand::Unsubscribe { id, topics } => {
                    if let Some(client) = clients.get_mut(&id) {
                        for topic in &topics {
                            client.topics.remove(topic);
                        }
                    }
                }
                HubCommand::Broadcast(frame) => {
                    for client in clients.values() {
                        if !client.topics.is_empty()
                            && !client.topics.contains(&frame.frame_type)
                        {
                            continue;
                        }
                        // Full outbox: drop for this client, keep fanning
                        // out to the rest.
                        if client.tx.try_send(frame.clone()).is_err() {
                            dropped += 1;
                            if dropped.is_power_of_two() {
                                warn!(dropped, "slow push clients dropping frames");
                            }
                        }
                    }
                }
            }
        }
    });

    handle
}

/// Drive one accepted WebSocket connection.
pub async fn handle_socket(hub: HubHandle, socket: WebSocket) {
    let id = hub.allocate_id();
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Frame>(OUTBOX_CAPACITY);
    hub.register(id, outbox_tx.clone()).await;

    let (mut sink, mut stream) = socket.split();

    // Writer: drains the outbox and emits keepalive pings.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.tick().await; // immediate first tick
        loop {
            let frame = tokio::select! {
                frame = outbox_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = ping.tick() => Frame::new("ping", serde_json::Value::Null, None),
            };
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader: subscription control, ping/pong, and error frames for
    // malformed input.
    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(control) => match control.message_type.as_str() {
                "subscribe" | "unsubscribe" => {
                    let topics: TopicsPayload =
                        serde_json::from_value(control.payload).unwrap_or_default();
                    if control.message_type == "subscribe" {
                        hub.subscribe(id, topics.topics).await;
                    } else {
                        hub.unsubscribe(id, topics.topics).await;
                    }
                }
                "ping" => {
                    let _ = outbox_tx
                        .try_send(Frame::new("pong", serde_json::Value::Null, None));
                }
                "pong" => {}
                other => {
                    let _ = outbox_tx.try_send(Frame::new(
                        "error",
                        serde_json::json!({ "message": format!("unknown message type {other}") }),
                        None,
                    ));
                }
            },
            Err(e) => {
                let _ = outbox_tx.try_send(Frame::new(
                    "error",
                    serde_json::json!({ "message": format!("malformed message: {e}") }),
                    None,
                ));
            }
        }
    }

    hub.deregister(id).await;
    writer.abort();
}
