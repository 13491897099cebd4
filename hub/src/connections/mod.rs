//! Connection Hub (C5): per-user connection registry, authenticated bind,
//! lifecycle, and heartbeat.

pub mod queue;

use crate::presence::PresenceStore;
use crate::rooms::RoomManager;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use dashmap::{DashMap, DashSet};
use futures_util::{SinkExt, StreamExt};
pub use queue::{OutboundQueue, Priority, PushOutcome};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub type ConnId = u64;

/// Close code for an auth failure at socket-open time.
pub const CLOSE_CODE_AUTH_FAILED: u16 = 4001;
/// Close code used when a saturated critical outbound queue forces a
/// disconnect.
pub const CLOSE_CODE_FLOW_ERROR: u16 = 4002;

pub struct ConnectionHandle {
    pub id: ConnId,
    pub user_id: Uuid,
    pub queue: Arc<OutboundQueue>,
}

/// The subset of `ConnectionHub` that frame-relaying services (C8 chat, C9
/// media signaling) actually depend on. Routing through this trait instead
/// of the concrete hub lets tests substitute a no-op double instead of
/// wiring up a real connection registry.
pub trait FrameSink: Send + Sync {
    fn send_to_user(&self, user_id: Uuid, message: Message, priority: Priority);
    fn broadcast_room(&self, room: &str, message: Message, priority: Priority, exclude: Option<ConnId>);
}

/// Implemented by the API layer (C10) so the connection hub can dispatch
/// inbound frames without depending on the frame-type catalogue itself.
#[async_trait]
pub trait FrameDispatcher: Send + Sync {
    async fn on_open(&self, conn: &ConnectionHandle);
    /// Returns `Err` if the raw text failed to parse or the handler reported
    /// an error; the caller decides whether to close the connection.
    async fn dispatch(&self, conn: &ConnectionHandle, raw: &str) -> Result<(), crate::error::AppError>;
    async fn on_close(&self, conn: &ConnectionHandle);
}

pub struct ConnectionHub {
    connections: DashMap<ConnId, Arc<ConnectionHandle>>,
    user_conns: DashMap<Uuid, DashSet<ConnId>>,
    rooms: Arc<RoomManager>,
    presence: Arc<PresenceStore>,
    next_id: AtomicU64,
    queue_depth: usize,
    heartbeat: Duration,
    offline_grace: Duration,
    validation_error_window: DashMap<ConnId, (u32, std::time::Instant)>,
}

impl ConnectionHub {
    pub fn new(
        rooms: Arc<RoomManager>,
        presence: Arc<PresenceStore>,
        queue_depth: usize,
        heartbeat: Duration,
        offline_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            user_conns: DashMap::new(),
            rooms,
            presence,
            next_id: AtomicU64::new(1),
            queue_depth,
            heartbeat,
            offline_grace,
            validation_error_window: DashMap::new(),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_user(&self, conn_id: ConnId) -> Option<Uuid> {
        self.connections.get(&conn_id).map(|c| c.user_id)
    }

    pub fn user_connection_count(&self, user_id: Uuid) -> usize {
        self.user_conns.get(&user_id).map(|c| c.len()).unwrap_or(0)
    }

    fn register(self: &Arc<Self>, user_id: Uuid) -> Arc<ConnectionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConnectionHandle {
            id,
            user_id,
            queue: Arc::new(OutboundQueue::new(self.queue_depth)),
        });
        self.connections.insert(id, handle.clone());
        self.user_conns.entry(user_id).or_default().insert(id);
        handle
    }

    fn deregister(self: &Arc<Self>, conn_id: ConnId) {
        if let Some((_, handle)) = self.connections.remove(&conn_id) {
            handle.queue.close();
            if let Some(conns) = self.user_conns.get(&handle.user_id) {
                conns.remove(&conn_id);
            }
        }
        self.validation_error_window.remove(&conn_id);
        self.rooms.leave_all(conn_id);
    }

    pub fn send_to(&self, conn_id: ConnId, message: Message, priority: Priority) -> Option<PushOutcome> {
        self.connections
            .get(&conn_id)
            .map(|c| c.queue.push(message, priority))
    }

    pub fn send_to_user(&self, user_id: Uuid, message: Message, priority: Priority) {
        if let Some(conns) = self.user_conns.get(&user_id) {
            for conn_id in conns.iter() {
                self.send_to(*conn_id, message.clone(), priority);
            }
        }
    }

    /// Enumerates room membership synchronously and enqueues onto each
    /// member's outbound queue in one pass, so room members observe a
    /// consistent send order.
    pub fn broadcast_room(&self, room: &str, message: Message, priority: Priority, exclude: Option<ConnId>) {
        for conn_id in self.rooms.members(room) {
            if Some(conn_id) == exclude {
                continue;
            }
            self.send_to(conn_id, message.clone(), priority);
        }
    }

    /// Enqueues `message` onto every currently-registered connection's
    /// outbound queue, regardless of room membership. Used for process-wide
    /// broadcasts that aren't scoped to a room, such as the market engine's
    /// (C4) `biome_market_update` fan-out.
    pub fn broadcast_all(&self, message: Message, priority: Priority) {
        for entry in self.connections.iter() {
            entry.value().queue.push(message.clone(), priority);
        }
    }

    /// Records a validation error for `conn_id`; returns `true` once the
    /// connection has exceeded 10 validation errors within a 60s window.
    fn record_validation_error(&self, conn_id: ConnId) -> bool {
        let now = std::time::Instant::now();
        let mut entry = self
            .validation_error_window
            .entry(conn_id)
            .or_insert((0, now));
        if now.duration_since(entry.1) > Duration::from_secs(60) {
            *entry = (0, now);
        }
        entry.0 += 1;
        entry.0 > 10
    }
}

impl FrameSink for ConnectionHub {
    fn send_to_user(&self, user_id: Uuid, message: Message, priority: Priority) {
        ConnectionHub::send_to_user(self, user_id, message, priority)
    }

    fn broadcast_room(&self, room: &str, message: Message, priority: Priority, exclude: Option<ConnId>) {
        ConnectionHub::broadcast_room(self, room, message, priority, exclude)
    }
}

/// A `FrameSink` that drops everything, for unit tests that exercise state
/// machines (call lifecycle, live registry) without a real connection.
#[cfg(test)]
pub struct NoopFrameSink;

#[cfg(test)]
impl FrameSink for NoopFrameSink {
    fn send_to_user(&self, _user_id: Uuid, _message: Message, _priority: Priority) {}
    fn broadcast_room(&self, _room: &str, _message: Message, _priority: Priority, _exclude: Option<ConnId>) {}
}

/// Broadcasts a `presence_update` frame to the room at the user's current
/// location, if any. Connections without a location yet (never sent an
/// `update_location` frame) have no room to notify and are skipped.
async fn broadcast_presence_update(hub: &ConnectionHub, presence: &PresenceStore, user_id: Uuid, online: bool) {
    let location = match presence.location(user_id).await {
        Ok(location) => location,
        Err(err) => {
            tracing::warn!(error = %err, user_id = %user_id, "failed to load location for presence broadcast");
            return;
        },
    };
    let Some(location) = location else { return };
    let room = crate::rooms::land_room_id(location.x, location.y);
    let frame = serde_json::json!({
        "type": "presence_update",
        "user_id": user_id,
        "online": online,
        "x": location.x,
        "y": location.y,
    });
    if let Ok(text) = serde_json::to_string(&frame) {
        hub.broadcast_room(&room, Message::Text(text), Priority::NonCritical, None);
    }
}

/// Runs a single upgraded WebSocket connection end to end: registration,
/// reader/writer tasks, heartbeat enforcement, and cleanup. `user_id` must
/// already have been authenticated by the caller.
pub async fn handle_socket(
    hub: Arc<ConnectionHub>,
    dispatcher: Arc<dyn FrameDispatcher>,
    socket: WebSocket,
    user_id: Uuid,
) {
    let handle = hub.register(user_id);
    tracing::info!(conn_id = handle.id, user_id = %user_id, "connection opened");

    if let Err(err) = hub.presence.mark_online(user_id).await {
        tracing::warn!(error = %err, user_id = %user_id, "failed to mark user online");
    }
    broadcast_presence_update(&hub, &hub.presence, user_id, true).await;
    dispatcher.on_open(&handle).await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_queue = handle.queue.clone();
    let writer_conn_id = handle.id;
    let writer = tokio::spawn(async move {
        loop {
            let saturated = writer_queue.saturated_for();
            if let Some(elapsed) = saturated {
                if elapsed > Duration::from_secs(2) {
                    tracing::warn!(conn_id = writer_conn_id, "outbound queue saturated, closing");
                    let _ = ws_tx
                        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code: CLOSE_CODE_FLOW_ERROR,
                            reason: "outbound queue saturated".into(),
                        })))
                        .await;
                    break;
                }
            }
            match tokio::time::timeout(Duration::from_millis(500), writer_queue.pop()).await {
                Ok(Some(message)) => {
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                },
                Ok(None) => break, // queue closed
                Err(_) => continue, // timed out, re-check saturation
            }
        }
    });

    let heartbeat = hub.heartbeat;
    loop {
        match tokio::time::timeout(heartbeat, ws_rx.next()).await {
            Err(_) => {
                tracing::info!(conn_id = handle.id, "heartbeat timeout, closing");
                break;
            },
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            Ok(Some(Ok(Message::Binary(_)))) => continue,
            Ok(Some(Ok(Message::Text(text)))) => {
                if text.trim() == r#"{"type":"ping"}"# {
                    handle.queue.push(
                        Message::Text(r#"{"type":"pong"}"#.to_string()),
                        Priority::Critical,
                    );
                    continue;
                }
                match dispatcher.dispatch(&handle, &text).await {
                    Ok(()) => {},
                    Err(err) => {
                        let close = err.should_close_connection();
                        let frame = err.to_ws_frame(None);
                        if let Ok(json) = serde_json::to_string(&frame) {
                            handle.queue.push(Message::Text(json), Priority::Critical);
                        }
                        let too_many_validation_errors = matches!(err, crate::error::AppError::Validation(_))
                            && hub.record_validation_error(handle.id);
                        if close || too_many_validation_errors {
                            break;
                        }
                    },
                }
            },
        }
    }

    writer.abort();
    dispatcher.on_close(&handle).await;
    hub.deregister(handle.id);

    if hub.user_connection_count(user_id) == 0 {
        let presence = hub.presence.clone();
        let hub_for_grace = hub.clone();
        let grace = hub.offline_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if hub_for_grace.user_connection_count(user_id) == 0 {
                broadcast_presence_update(&hub_for_grace, &presence, user_id, false).await;
                if let Err(err) = presence.mark_offline(user_id).await {
                    tracing::warn!(error = %err, user_id = %user_id, "failed to mark user offline");
                }
            }
        });
    }
    tracing::info!(conn_id = handle.id, user_id = %user_id, "connection closed");
}
