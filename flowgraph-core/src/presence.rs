//! Ephemeral presence ("awareness") for collaborative sessions.
//!
//! Presence never touches the pipeline document: it lives in a separate,
//! broadcast-only channel and disappears with the session that owns it.
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! AwarenessTracker::update_cursor()   ── AwarenessMessage::State (own slot only)
//!       │
//!       ▼   (relay broadcast)
//! remote AwarenessTracker::handle_message()
//!       │
//!       ▼
//! PresenceChange ── user_joined / user_updated / user_left
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::CollabError;
use crate::events::CollabEvent;

/// Fixed palette for presence colors.
pub const PALETTE: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7",
    "#DDA0DD", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E2",
];

/// Stable color for a user id.
///
/// Sum of UTF-16 code units modulo the palette size, so a browser client
/// computing `charCodeAt` sums lands on the same color.
pub fn color_for_user(user_id: &str) -> &'static str {
    let sum: u64 = user_id.encode_utf16().map(u64::from).sum();
    PALETTE[(sum % PALETTE.len() as u64) as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Editing,
    Offline,
}

/// Where a user is pointing in the pipeline canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub node_id: Option<String>,
    pub x: f64,
    pub y: f64,
    /// Selected node/edge ids.
    pub selection: Vec<String>,
}

impl CursorPosition {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            node_id: None,
            x,
            y,
            selection: Vec::new(),
        }
    }

    pub fn on_node(node_id: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::at(x, y)
        }
    }
}

/// One session's presence slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub user_id: String,
    pub name: String,
    pub color: String,
    pub status: PresenceStatus,
    pub cursor: Option<CursorPosition>,
}

impl PresenceState {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            color: color_for_user(&user_id).to_string(),
            user_id,
            name: name.into(),
            status: PresenceStatus::Online,
            cursor: None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Awareness frames carried inside the sync protocol's awareness payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full replacement of the sender's own slot.
    State {
        session_id: Uuid,
        /// Per-session counter; older states are discarded.
        clock: u64,
        state: PresenceState,
    },

    /// Clean departure.
    Leave { session_id: Uuid },
}

impl AwarenessMessage {
    pub fn session_id(&self) -> Uuid {
        match self {
            AwarenessMessage::State { session_id, .. } => *session_id,
            AwarenessMessage::Leave { session_id } => *session_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(msg)
    }
}

/// What a remote awareness frame did to the local peer map.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Joined(PresenceState),
    Updated(PresenceState),
    Left(PresenceState),
}

impl PresenceChange {
    pub fn into_event(self) -> CollabEvent {
        match self {
            PresenceChange::Joined(s) => CollabEvent::UserJoined(s),
            PresenceChange::Updated(s) => CollabEvent::UserUpdated(s),
            PresenceChange::Left(s) => CollabEvent::UserLeft(s),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RemotePresence {
    state: PresenceState,
    clock: u64,
    last_update: Instant,
}

/// Local slot plus a mirror of every remote session's slot.
pub struct AwarenessTracker {
    session_id: Uuid,
    local: PresenceState,
    clock: u64,
    peers: HashMap<Uuid, RemotePresence>,
}

impl AwarenessTracker {
    pub fn new(session_id: Uuid, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            session_id,
            local: PresenceState::new(user_id, name),
            clock: 0,
            peers: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn local_state(&self) -> &PresenceState {
        &self.local
    }

    /// Current local slot as a broadcastable frame.
    pub fn local_message(&mut self) -> AwarenessMessage {
        self.clock += 1;
        AwarenessMessage::State {
            session_id: self.session_id,
            clock: self.clock,
            state: self.local.clone(),
        }
    }

    pub fn update_cursor(&mut self, cursor: CursorPosition) -> AwarenessMessage {
        self.local.cursor = Some(cursor);
        self.local_message()
    }

    pub fn clear_cursor(&mut self) -> AwarenessMessage {
        self.local.cursor = None;
        self.local_message()
    }

    pub fn set_status(&mut self, status: PresenceStatus) -> AwarenessMessage {
        self.local.status = status;
        self.local_message()
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            session_id: self.session_id,
        }
    }

    /// Apply a frame from the network.
    ///
    /// Frames about our own slot and stale frames are ignored.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> Option<PresenceChange> {
        if msg.session_id() == self.session_id {
            return None;
        }

        match msg {
            AwarenessMessage::State {
                session_id,
                clock,
                state,
            } => match self.peers.get_mut(session_id) {
                Some(peer) => {
                    if *clock <= peer.clock {
                        return None;
                    }
                    peer.clock = *clock;
                    peer.last_update = Instant::now();
                    if peer.state == *state {
                        return None;
                    }
                    peer.state = state.clone();
                    Some(PresenceChange::Updated(state.clone()))
                }
                None => {
                    self.peers.insert(
                        *session_id,
                        RemotePresence {
                            state: state.clone(),
                            clock: *clock,
                            last_update: Instant::now(),
                        },
                    );
                    Some(PresenceChange::Joined(state.clone()))
                }
            },

            AwarenessMessage::Leave { session_id } => self
                .remove_session(session_id)
                .map(PresenceChange::Left),
        }
    }

    /// Drop a session whose transport went away.
    pub fn remove_session(&mut self, session_id: &Uuid) -> Option<PresenceState> {
        self.peers.remove(session_id).map(|p| p.state)
    }

    /// Forget every remote session (local transport lost).
    pub fn clear_peers(&mut self) -> Vec<PresenceState> {
        self.peers.drain().map(|(_, p)| p.state).collect()
    }

    /// Remove sessions silent for longer than `timeout`.
    pub fn cleanup_idle_peers(&mut self, timeout: Duration) -> Vec<PresenceState> {
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_update.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();

        stale
            .iter()
            .filter_map(|id| self.peers.remove(id))
            .map(|p| p.state)
            .collect()
    }

    /// Remote sessions currently present, ordered by user id.
    pub fn online_users(&self) -> Vec<PresenceState> {
        let mut users: Vec<PresenceState> =
            self.peers.values().map(|p| p.state.clone()).collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id).then_with(|| a.name.cmp(&b.name)));
        users
    }

    pub fn peer(&self, session_id: &Uuid) -> Option<&PresenceState> {
        self.peers.get(session_id).map(|p| &p.state)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
