//! Frame dispatcher (C10): routes inbound WebSocket frames from C5's reader
//! loop to C6-C9, and renders their outputs back onto C5's outbound queues.
//! Two `FrameDispatcher` impls share the handler functions below: the
//! general-purpose hub entry point and the call-signaling-only entry point
//! at `/webrtc/signal`.

use super::frames::{frame_type_name, InboundFrame, SIGNALING_ONLY_TYPES};
use super::AppState;
use crate::connections::{ConnectionHandle, FrameDispatcher, Priority};
use crate::error::{AppError, AppResult};
use crate::rooms::land_room_id;
use async_trait::async_trait;
use axum::extract::ws::Message as WsMessage;
use serde_json::json;
use std::sync::Arc;

fn send(conn: &ConnectionHandle, frame: serde_json::Value) {
    if let Ok(text) = serde_json::to_string(&frame) {
        conn.queue.push(WsMessage::Text(text), Priority::Critical);
    }
}

/// Parses `raw` and dispatches to the matching handler. Shared by both
/// dispatcher impls below; `allowed` restricts which frame types this entry
/// point accepts.
async fn dispatch_frame(
    state: &AppState,
    conn: &ConnectionHandle,
    raw: &str,
    allowed: Option<&[&str]>,
) -> AppResult<()> {
    if let Some(allowed) = allowed {
        let type_name = frame_type_name(raw).unwrap_or_default();
        if !allowed.contains(&type_name.as_str()) {
            return Err(AppError::Validation(format!(
                "frame type '{type_name}' is not accepted on this entry point"
            )));
        }
    }

    let frame: InboundFrame =
        serde_json::from_str(raw).map_err(|err| AppError::Validation(format!("malformed frame: {err}")))?;

    match frame {
        InboundFrame::JoinRoom { room } => handle_join_room(state, conn, &room).await,
        InboundFrame::LeaveRoom { room } => handle_leave_room(state, conn, &room).await,
        InboundFrame::SendMessage { room, text } => handle_send_message(state, conn, &room, &text).await,
        InboundFrame::UpdateLocation { x, y } => handle_update_location(state, conn, x, y).await,
        InboundFrame::Typing { room } => {
            state.hub.broadcast_room(
                &room,
                WsMessage::Text(json!({"type": "typing", "room": room, "user": conn.user_id}).to_string()),
                Priority::NonCritical,
                Some(conn.id),
            );
            Ok(())
        },
        InboundFrame::Ping => {
            send(conn, json!({"type": "pong"}));
            Ok(())
        },
        InboundFrame::LiveStart { room, media } => {
            state.media.live_start(conn.id, conn.user_id, &room, media);
            Ok(())
        },
        InboundFrame::LiveStop { room } => {
            state.media.live_stop(conn.id, conn.user_id, &room);
            Ok(())
        },
        InboundFrame::LiveStatus { room } => {
            let peers = state.media.live_peers(&room, conn.user_id);
            send(conn, json!({"type": "live_peers", "room": room, "peers": peers}));
            Ok(())
        },
        InboundFrame::CallInitiate { callee } => {
            state.media.call_initiate(conn.user_id, callee);
            Ok(())
        },
        InboundFrame::CallAccept { call_id } => state
            .media
            .call_accept(call_id, conn.user_id)
            .map_err(|msg| AppError::Conflict(msg.to_string())),
        InboundFrame::CallReject { call_id } => state
            .media
            .call_reject(call_id, conn.user_id)
            .map_err(|msg| AppError::Conflict(msg.to_string())),
        InboundFrame::CallHangup { call_id } => state
            .media
            .call_hangup(call_id, conn.user_id)
            .map_err(|msg| AppError::Conflict(msg.to_string())),
        InboundFrame::Offer { to, call_id, sdp } => {
            state.media.relay("offer", conn.user_id, to, call_id, sdp);
            Ok(())
        },
        InboundFrame::Answer { to, call_id, sdp } => {
            state.media.relay("answer", conn.user_id, to, call_id, sdp);
            Ok(())
        },
        InboundFrame::IceCandidate { to, call_id, candidate } => {
            state.media.relay("ice_candidate", conn.user_id, to, call_id, candidate);
            Ok(())
        },
    }
}

async fn handle_join_room(state: &AppState, conn: &ConnectionHandle, room: &str) -> AppResult<()> {
    state.rooms.join(conn.id, room);
    send(conn, json!({"type": "joined_room", "room": room}));
    let peers = state.media.live_peers(room, conn.user_id);
    send(conn, json!({"type": "live_peers", "room": room, "peers": peers}));
    state.hub.broadcast_room(
        room,
        WsMessage::Text(json!({"type": "user_joined", "room": room, "user": conn.user_id}).to_string()),
        Priority::NonCritical,
        Some(conn.id),
    );
    Ok(())
}

async fn handle_leave_room(state: &AppState, conn: &ConnectionHandle, room: &str) -> AppResult<()> {
    let was_member = state.rooms.leave(conn.id, room);
    if was_member {
        send(conn, json!({"type": "left_room", "room": room}));
        state.hub.broadcast_room(
            room,
            WsMessage::Text(json!({"type": "user_left", "room": room, "user": conn.user_id}).to_string()),
            Priority::NonCritical,
            Some(conn.id),
        );
    }
    Ok(())
}

async fn handle_send_message(state: &AppState, conn: &ConnectionHandle, room: &str, text: &str) -> AppResult<()> {
    if text.trim().is_empty() {
        return Err(AppError::Validation("message text must not be empty".to_string()));
    }
    let rate_key = format!("ratelimit:send_message:{}", conn.user_id);
    if !state.cache.rate_limit_check(&rate_key, 20, 10).await? {
        return Err(AppError::RateLimited { retry_after_secs: 10 });
    }
    state.chat.send_message(conn.user_id, room, text).await?;
    Ok(())
}

/// Migrates the connection's land-proximity room membership to match its
/// new coordinates.
async fn handle_update_location(state: &AppState, conn: &ConnectionHandle, x: i32, y: i32) -> AppResult<()> {
    let previous = state.presence.location(conn.user_id).await?;
    state.presence.set_location(conn.user_id, x, y).await?;

    let new_room = land_room_id(x, y);
    match previous {
        Some(previous) => {
            let old_room = land_room_id(previous.x, previous.y);
            if old_room != new_room {
                state.rooms.leave(conn.id, &old_room);
                state.rooms.join(conn.id, &new_room);
            }
        },
        None => state.rooms.join(conn.id, &new_room),
    }

    send(conn, json!({"type": "location_updated", "x": x, "y": y}));
    state.hub.broadcast_room(
        &new_room,
        WsMessage::Text(
            json!({"type": "presence_update", "user_id": conn.user_id, "online": true, "x": x, "y": y}).to_string(),
        ),
        Priority::NonCritical,
        Some(conn.id),
    );
    Ok(())
}

/// The general-purpose hub entry point: `/ws/connect?token=...`, accepting
/// every frame type in the canonical inbound set.
pub struct HubDispatcher {
    pub state: Arc<AppState>,
}

#[async_trait]
impl FrameDispatcher for HubDispatcher {
    async fn on_open(&self, conn: &ConnectionHandle) {
        send(conn, json!({"type": "connected", "user_id": conn.user_id}));
    }

    async fn dispatch(&self, conn: &ConnectionHandle, raw: &str) -> Result<(), AppError> {
        dispatch_frame(&self.state, conn, raw, None).await
    }

    async fn on_close(&self, conn: &ConnectionHandle) {
        self.state.media.handle_connection_closed(conn.id, conn.user_id);
    }
}

/// The call-signaling-only entry point: `/webrtc/signal?token=...`.
pub struct SignalingDispatcher {
    pub state: Arc<AppState>,
}

#[async_trait]
impl FrameDispatcher for SignalingDispatcher {
    async fn on_open(&self, conn: &ConnectionHandle) {
        send(conn, json!({"type": "connected", "user_id": conn.user_id}));
    }

    async fn dispatch(&self, conn: &ConnectionHandle, raw: &str) -> Result<(), AppError> {
        dispatch_frame(&self.state, conn, raw, Some(SIGNALING_ONLY_TYPES)).await
    }

    async fn on_close(&self, conn: &ConnectionHandle) {
        self.state.media.handle_connection_closed(conn.id, conn.user_id);
    }
}
