//! The inbound WebSocket frame catalogue. Frames arrive as untyped JSON;
//! `InboundFrame` is a tagged union of request variants keyed on `type`. An
//! unrecognized `type` fails to deserialize and the dispatcher turns that
//! into `AppError::Validation`.

use crate::media::MediaType;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    JoinRoom { room: String },
    LeaveRoom { room: String },
    SendMessage { room: String, text: String },
    UpdateLocation { x: i32, y: i32 },
    Typing { room: String },
    Ping,
    LiveStart { room: String, media: MediaType },
    LiveStop { room: String },
    LiveStatus { room: String },
    CallInitiate { callee: Uuid },
    CallAccept { call_id: Uuid },
    CallReject { call_id: Uuid },
    CallHangup { call_id: Uuid },
    Offer { to: Uuid, call_id: Option<Uuid>, sdp: Value },
    Answer { to: Uuid, call_id: Option<Uuid>, sdp: Value },
    IceCandidate { to: Uuid, call_id: Option<Uuid>, candidate: Value },
}

/// Pulled out separately so an `error` frame can echo back the client's
/// correlation id even when the rest of the frame fails to parse as a
/// known `InboundFrame` variant.
#[derive(Debug, Deserialize, Default)]
pub struct FrameEnvelope {
    pub id: Option<String>,
}

/// Frame `type` names this entry point accepts; everything else is a
/// `ValidationError` here even if it's valid on the general-purpose hub
/// entry point.
pub const SIGNALING_ONLY_TYPES: &[&str] = &[
    "ping",
    "call_initiate",
    "call_accept",
    "call_reject",
    "call_hangup",
    "offer",
    "answer",
    "ice_candidate",
];

pub fn frame_type_name(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    value.get("type")?.as_str().map(|s| s.to_string())
}
