//! Binary protocol between sync providers and the relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬─────────────┬──────────┬──────────┐
//! │ msg_type │ session_id │ pipeline_id │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes   │ len + utf8  │ varint   │ variable │
//! └──────────┴────────────┴─────────────┴──────────┴──────────┘
//! ```
//!
//! Payloads by type: yrs state vector (`SyncStep1`), yrs update
//! (`SyncStep2`, `Delta`), bincode [`AwarenessMessage`] (`Awareness`),
//! bincode [`PeerInfo`] (`PeerJoined`), empty otherwise.
//!
//! The upgrade request itself is `{server_url}/{pipeline_id}?userId=..&userName=..`
//! (see [`ConnectParams`]), so the relay knows who is joining before the
//! first frame arrives.

use flowgraph_core::AwarenessMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asks the receiver for what the sender lacks
    SyncStep1 = 1,
    /// Yrs diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental yrs update
    Delta = 3,
    /// Presence slot write or leave
    Awareness = 4,
    /// Session identity announcement
    PeerJoined = 5,
    /// Session left the room
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
}

/// Identity a session announces when it joins a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub session_id: Uuid,
    pub user_id: String,
    pub user_name: String,
    /// Hex cursor color from the shared palette
    pub color: String,
}

impl PeerInfo {
    pub fn new(session_id: Uuid, user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = flowgraph_core::color_for_user(&user_id).to_string();
        Self {
            session_id,
            user_id,
            user_name: user_name.into(),
            color,
        }
    }
}

/// Identity carried as query parameters of the WebSocket upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub user_id: String,
    pub user_name: String,
}

impl ConnectParams {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }

    /// `{server_url}/{pipeline_id}?userId=..&userName=..`
    pub fn url(&self, server_url: &str, pipeline_id: &str) -> String {
        format!(
            "{}/{}?{}",
            server_url.trim_end_matches('/'),
            pipeline_id,
            self.to_query()
        )
    }

    pub fn to_query(&self) -> String {
        format!(
            "userId={}&userName={}",
            percent_encode(&self.user_id),
            percent_encode(&self.user_name)
        )
    }

    /// Parse a request query string. `None` unless both parameters are
    /// present, decodable and non-empty.
    pub fn from_query(query: &str) -> Option<Self> {
        let mut user_id = None;
        let mut user_name = None;
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "userId" => user_id = percent_decode(value),
                "userName" => user_name = percent_decode(value),
                _ => {}
            }
        }
        match (user_id, user_name) {
            (Some(user_id), Some(user_name)) if !user_id.is_empty() && !user_name.is_empty() => {
                Some(Self { user_id, user_name })
            }
            _ => None,
        }
    }
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn percent_decode(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

/// Top-level protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub session_id: Uuid,
    pub pipeline_id: String,
    /// Sender-local sequence number
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, session_id: Uuid, pipeline_id: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            session_id,
            pipeline_id: pipeline_id.to_string(),
            clock,
            payload,
        }
    }

    pub fn delta(session_id: Uuid, pipeline_id: &str, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, session_id, pipeline_id, clock, update)
    }

    pub fn sync_step1(session_id: Uuid, pipeline_id: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, session_id, pipeline_id, 0, state_vector)
    }

    pub fn sync_step2(session_id: Uuid, pipeline_id: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, session_id, pipeline_id, 0, diff)
    }

    pub fn awareness(
        session_id: Uuid,
        pipeline_id: &str,
        clock: u64,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        let payload = message
            .encode()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::Awareness, session_id, pipeline_id, clock, payload))
    }

    pub fn peer_joined(pipeline_id: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, info.session_id, pipeline_id, 0, payload))
    }

    pub fn peer_left(session_id: Uuid, pipeline_id: &str) -> Self {
        Self::new(MessageType::PeerLeft, session_id, pipeline_id, 0, Vec::new())
    }

    pub fn ping(session_id: Uuid) -> Self {
        Self::new(MessageType::Ping, session_id, "", 0, Vec::new())
    }

    pub fn pong(session_id: Uuid) -> Self {
        Self::new(MessageType::Pong, session_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the awareness payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        AwarenessMessage::decode(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse the peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
