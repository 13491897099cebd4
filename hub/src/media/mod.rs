//! Live Media Signaling (C9): the room-scoped live broadcast registry and
//! the 1:1 call lifecycle, both relaying WebRTC signaling frames without
//! ever inspecting or mixing the media itself.

use crate::connections::{ConnId, FrameSink, Priority};
use crate::rooms::RoomManager;
use axum::extract::ws::Message as WsMessage;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Audio,
    Video,
}

#[derive(Clone, Debug, Serialize)]
pub struct LivePeer {
    pub user: Uuid,
    pub media: MediaType,
}

struct Broadcaster {
    conn_id: ConnId,
    media: MediaType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Ringing,
    Active,
    Ended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    Hangup,
    Reject,
    Timeout,
    ConnectionClosed,
}

struct Call {
    caller: Uuid,
    callee: Uuid,
    state: CallState,
    created_at: DateTime<Utc>,
}

impl Call {
    fn other(&self, user: Uuid) -> Option<Uuid> {
        if user == self.caller {
            Some(self.callee)
        } else if user == self.callee {
            Some(self.caller)
        } else {
            None
        }
    }

    fn involves(&self, user: Uuid) -> bool {
        self.caller == user || self.callee == user
    }
}

/// Per-room live broadcaster registry plus the 1:1 call registry. Both
/// sub-protocols share the same relay helper for `offer`/`answer`/
/// `ice_candidate` frames, since the hub treats them identically: opaque
/// payloads addressed to one target user.
pub struct MediaSignaling {
    hub: Arc<dyn FrameSink>,
    rooms: Arc<RoomManager>,
    live: DashMap<String, DashMap<Uuid, Broadcaster>>,
    calls: DashMap<Uuid, Call>,
    ringing_timeout: Duration,
}

impl MediaSignaling {
    pub fn new(hub: Arc<dyn FrameSink>, rooms: Arc<RoomManager>, ringing_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            hub,
            rooms,
            live: DashMap::new(),
            calls: DashMap::new(),
            ringing_timeout,
        })
    }

    fn send_to_user(&self, user: Uuid, frame: serde_json::Value) {
        if let Ok(text) = serde_json::to_string(&frame) {
            self.hub.send_to_user(user, WsMessage::Text(text), Priority::Critical);
        }
    }

    fn broadcast_room(&self, room: &str, frame: serde_json::Value, exclude: Option<ConnId>) {
        if let Ok(text) = serde_json::to_string(&frame) {
            self.hub.broadcast_room(room, WsMessage::Text(text), Priority::Critical, exclude);
        }
    }

    // -- A. Room-scoped live broadcast ----------------------------------

    /// Registers `user`'s connection as a broadcaster in `room`.
    pub fn live_start(&self, conn_id: ConnId, user: Uuid, room: &str, media: MediaType) {
        self.live
            .entry(room.to_string())
            .or_default()
            .insert(user, Broadcaster { conn_id, media });
        self.broadcast_room(
            room,
            json!({"type": "live_peer_joined", "room": room, "user": user, "media": media}),
            Some(conn_id),
        );
    }

    /// Deregisters `user` as a broadcaster in `room` and notifies the room.
    pub fn live_stop(&self, conn_id: ConnId, user: Uuid, room: &str) {
        if let Some(room_entry) = self.live.get(room) {
            let removed = room_entry
                .get(&user)
                .map(|b| b.conn_id == conn_id)
                .unwrap_or(false);
            if removed {
                room_entry.remove(&user);
            }
        }
        self.broadcast_room(room, json!({"type": "live_peer_left", "room": room, "user": user}), None);
    }

    /// The peers currently broadcasting in `room`, excluding `requester`
    /// itself.
    pub fn live_peers(&self, room: &str, requester: Uuid) -> Vec<LivePeer> {
        let Some(room_entry) = self.live.get(room) else {
            return Vec::new();
        };
        room_entry
            .iter()
            .filter(|entry| *entry.key() != requester)
            .map(|entry| LivePeer {
                user: *entry.key(),
                media: entry.value().media,
            })
            .collect()
    }

    pub fn is_broadcasting(&self, room: &str, user: Uuid) -> bool {
        self.live.get(room).map(|r| r.contains_key(&user)).unwrap_or(false)
    }

    // -- Point-to-point signaling relay (shared by both sub-protocols) --

    /// Forwards an `offer`/`answer`/`ice_candidate` frame to `to` verbatim;
    /// the hub never inspects or modifies the payload.
    pub fn relay(&self, frame_type: &str, from: Uuid, to: Uuid, call_id: Option<Uuid>, payload: serde_json::Value) {
        self.send_to_user(
            to,
            json!({"type": frame_type, "from": from, "call_id": call_id, "payload": payload}),
        );
    }

    // -- B. 1:1 call lifecycle -------------------------------------------

    /// Starts a new call, returning its id. Emits `incoming_call` to the
    /// callee; the caller's `call_initiated` ack is the caller's
    /// responsibility to send (it already knows the id it gets back here).
    pub fn call_initiate(self: &Arc<Self>, caller: Uuid, callee: Uuid) -> Uuid {
        let call_id = Uuid::new_v4();
        self.calls.insert(
            call_id,
            Call {
                caller,
                callee,
                state: CallState::Ringing,
                created_at: Utc::now(),
            },
        );
        self.send_to_user(
            caller,
            json!({"type": "call_initiated", "call_id": call_id, "callee": callee}),
        );
        self.send_to_user(
            callee,
            json!({"type": "incoming_call", "call_id": call_id, "caller": caller}),
        );
        self.spawn_ringing_timeout(call_id);
        call_id
    }

    fn spawn_ringing_timeout(self: &Arc<Self>, call_id: Uuid) {
        let this = self.clone();
        let timeout = self.ringing_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.timeout_if_still_ringing(call_id);
        });
    }

    fn timeout_if_still_ringing(&self, call_id: Uuid) {
        let Some(mut entry) = self.calls.get_mut(&call_id) else { return };
        if entry.state != CallState::Ringing {
            return;
        }
        entry.state = CallState::Ended;
        let (caller, callee) = (entry.caller, entry.callee);
        drop(entry);
        self.emit_call_ended(call_id, caller, callee, CallEndReason::Timeout);
    }

    /// `callee` accepts `call_id`. Transitions `ringing -> active` and lets
    /// both sides know the call is live so SDP/ICE exchange can begin.
    pub fn call_accept(&self, call_id: Uuid, callee: Uuid) -> Result<(), &'static str> {
        let Some(mut call) = self.calls.get_mut(&call_id) else {
            return Err("call not found");
        };
        if call.callee != callee {
            return Err("caller is not the callee of this call");
        }
        if call.state != CallState::Ringing {
            return Err("call is not ringing");
        }
        call.state = CallState::Active;
        let caller = call.caller;
        drop(call);

        self.send_to_user(caller, json!({"type": "call_accepted", "call_id": call_id}));
        self.send_to_user(caller, json!({"type": "call_started", "call_id": call_id}));
        self.send_to_user(callee, json!({"type": "call_started", "call_id": call_id}));
        Ok(())
    }

    /// `callee` rejects `call_id`. Transitions `ringing -> ended`.
    pub fn call_reject(&self, call_id: Uuid, callee: Uuid) -> Result<(), &'static str> {
        let Some(mut call) = self.calls.get_mut(&call_id) else {
            return Err("call not found");
        };
        if call.callee != callee {
            return Err("caller is not the callee of this call");
        }
        if call.state != CallState::Ringing {
            return Err("call is not ringing");
        }
        call.state = CallState::Ended;
        let caller = call.caller;
        drop(call);
        self.send_to_user(caller, json!({"type": "call_rejected", "call_id": call_id}));
        Ok(())
    }

    /// Either participant hangs up; transitions to `ended` and notifies
    /// both sides.
    pub fn call_hangup(&self, call_id: Uuid, user: Uuid) -> Result<(), &'static str> {
        let Some(mut call) = self.calls.get_mut(&call_id) else {
            return Err("call not found");
        };
        if !call.involves(user) {
            return Err("user is not a participant in this call");
        }
        if call.state == CallState::Ended {
            return Ok(());
        }
        call.state = CallState::Ended;
        let (caller, callee) = (call.caller, call.callee);
        drop(call);
        self.emit_call_ended(call_id, caller, callee, CallEndReason::Hangup);
        Ok(())
    }

    fn emit_call_ended(&self, call_id: Uuid, caller: Uuid, callee: Uuid, reason: CallEndReason) {
        let frame = json!({"type": "call_ended", "call_id": call_id, "reason": reason});
        self.send_to_user(caller, frame.clone());
        self.send_to_user(callee, frame);
    }

    pub fn call_state(&self, call_id: Uuid) -> Option<CallState> {
        self.calls.get(&call_id).map(|c| c.state)
    }

    // -- Cleanup on connection close --------------------------------------

    /// Forces every call `user` participates in to `ended`, and removes any
    /// live broadcaster registrations `conn_id` holds across the rooms it
    /// was a member of, notifying peers.
    pub fn handle_connection_closed(&self, conn_id: ConnId, user: Uuid) {
        let stale_calls: Vec<Uuid> = self
            .calls
            .iter()
            .filter(|entry| entry.value().involves(user) && entry.value().state != CallState::Ended)
            .map(|entry| *entry.key())
            .collect();
        for call_id in stale_calls {
            if let Some(mut call) = self.calls.get_mut(&call_id) {
                call.state = CallState::Ended;
                let (caller, callee) = (call.caller, call.callee);
                drop(call);
                self.emit_call_ended(call_id, caller, callee, CallEndReason::ConnectionClosed);
            }
        }

        for room in self.rooms.rooms_of(conn_id) {
            self.live_stop(conn_id, user, &room);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::NoopFrameSink;

    fn mock_signaling() -> Arc<MediaSignaling> {
        let rooms = Arc::new(RoomManager::new());
        MediaSignaling::new(Arc::new(NoopFrameSink), rooms, Duration::from_secs(60))
    }

    #[test]
    fn live_peers_excludes_requester() {
        let sig = mock_signaling();
        sig.live_start(1, Uuid::new_v4(), "land_5_5", MediaType::Audio);
        let broadcaster = sig.live.get("land_5_5").unwrap().iter().next().unwrap().key().clone();
        assert!(sig.live_peers("land_5_5", broadcaster).is_empty());
    }

    #[test]
    fn call_lifecycle_accept_then_hangup() {
        let sig = mock_signaling();
        let caller = Uuid::new_v4();
        let callee = Uuid::new_v4();
        let call_id = sig.call_initiate(caller, callee);
        assert_eq!(sig.call_state(call_id), Some(CallState::Ringing));

        sig.call_accept(call_id, callee).unwrap();
        assert_eq!(sig.call_state(call_id), Some(CallState::Active));

        sig.call_hangup(call_id, caller).unwrap();
        assert_eq!(sig.call_state(call_id), Some(CallState::Ended));
    }

    #[test]
    fn reject_only_allowed_from_callee_while_ringing() {
        let sig = mock_signaling();
        let caller = Uuid::new_v4();
        let callee = Uuid::new_v4();
        let call_id = sig.call_initiate(caller, callee);
        assert!(sig.call_reject(call_id, caller).is_err());
        assert!(sig.call_reject(call_id, callee).is_ok());
        assert_eq!(sig.call_state(call_id), Some(CallState::Ended));
    }
}
