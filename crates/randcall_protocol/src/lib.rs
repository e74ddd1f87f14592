/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on a single signaling frame. Anything larger is rejected
/// before JSON parsing; SDP blobs are a few KB, chat lines far less.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallInfo {
    pub id: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub match_type: Option<String>,
}

/// Body of `POST /register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
}

/// Body of `POST /token/refresh`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
}

/// Transient matchmaking result; folds into the active call on success.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MatchResult {
    pub matched: bool,
    #[serde(default)]
    pub call: Option<CallInfo>,
    /// Username of the matched peer.
    #[serde(default)]
    pub matched_user: Option<String>,
    #[serde(default)]
    pub match_type: Option<String>,
    /// Which side emits the offer. Absent on older backends; the consumer
    /// falls back to a local default.
    #[serde(default)]
    pub initiator: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: String,
}

/// Session description as exchanged on the wire (browser-shaped JSON).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sdp {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// Trickle ICE candidate, field names matching RTCIceCandidateInit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Unit of exchange between two negotiation engines. Delivery is causal per
/// direction; duplicates are possible after a transport failover and must be
/// applied idempotently by the receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum SignalEnvelope {
    Offer(Sdp),
    Answer(Sdp),
    IceCandidate(IceCandidate),
}

impl SignalEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalEnvelope::Offer(_) => "offer",
            SignalEnvelope::Answer(_) => "answer",
            SignalEnvelope::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// One frame on the signaling channel: `{"type": ..., "message": ...}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum WsFrame {
    WebrtcSignal(SignalEnvelope),
    ChatMessage(ChatMessage),
    ConnectionEstablished,
    PeerLeft,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: serde_json::Value,
}

pub fn encode_frame(frame: &WsFrame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|_| String::from("{}"))
}

/// Decodes one signaling frame. Fails closed: malformed payloads and unknown
/// frame types are reported as `DecodeError`, never panics, no side effects.
pub fn decode_frame(text: &str) -> Result<WsFrame, DecodeError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::TooLarge(text.len()));
    }
    let raw: RawFrame = serde_json::from_str(text)?;
    match raw.kind.as_str() {
        "webrtc_signal" => Ok(WsFrame::WebrtcSignal(serde_json::from_value(raw.message)?)),
        "chat_message" => Ok(WsFrame::ChatMessage(serde_json::from_value(raw.message)?)),
        "connection_established" => Ok(WsFrame::ConnectionEstablished),
        "peer_left" => Ok(WsFrame::PeerLeft),
        other => Err(DecodeError::UnknownType(other.to_string())),
    }
}
