//! Typed publish/subscribe bus between the engine and its consumers.
//!
//! Delivery is synchronous and in subscription order. A panicking subscriber
//! is caught and logged; the remaining subscribers still receive the event and
//! the mutation that triggered it is unaffected.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::model::{Operation, Snapshot};
use crate::presence::PresenceState;

/// Transport connection state of a sync provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

/// Every notification the engine emits, with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    ConnectionStatus(ConnectionStatus),
    /// `true` once the local document has merged the remote state.
    SyncStatus(bool),
    NodeChanged(Operation),
    EdgeChanged(Operation),
    UserJoined(PresenceState),
    UserUpdated(PresenceState),
    /// Last known state of the departed session.
    UserLeft(PresenceState),
    SnapshotCreated(Snapshot),
    /// Carries the rollback marker operation.
    RollbackCompleted(Operation),
    RollbackFailed { snapshot_id: String, reason: String },
}

impl CollabEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionStatus(_) => EventKind::ConnectionStatus,
            Self::SyncStatus(_) => EventKind::SyncStatus,
            Self::NodeChanged(_) => EventKind::NodeChanged,
            Self::EdgeChanged(_) => EventKind::EdgeChanged,
            Self::UserJoined(_) => EventKind::UserJoined,
            Self::UserUpdated(_) => EventKind::UserUpdated,
            Self::UserLeft(_) => EventKind::UserLeft,
            Self::SnapshotCreated(_) => EventKind::SnapshotCreated,
            Self::RollbackCompleted(_) => EventKind::RollbackCompleted,
            Self::RollbackFailed { .. } => EventKind::RollbackFailed,
        }
    }
}

/// Subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionStatus,
    SyncStatus,
    NodeChanged,
    EdgeChanged,
    UserJoined,
    UserUpdated,
    UserLeft,
    SnapshotCreated,
    RollbackCompleted,
    RollbackFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::ConnectionStatus,
        EventKind::SyncStatus,
        EventKind::NodeChanged,
        EventKind::EdgeChanged,
        EventKind::UserJoined,
        EventKind::UserUpdated,
        EventKind::UserLeft,
        EventKind::SnapshotCreated,
        EventKind::RollbackCompleted,
        EventKind::RollbackFailed,
    ];

    /// Wire name used by UI collaborators.
    pub fn name(self) -> &'static str {
        match self {
            Self::ConnectionStatus => "connection_status",
            Self::SyncStatus => "sync_status",
            Self::NodeChanged => "node_changed",
            Self::EdgeChanged => "edge_changed",
            Self::UserJoined => "user_joined",
            Self::UserUpdated => "user_updated",
            Self::UserLeft => "user_left",
            Self::SnapshotCreated => "snapshot_created",
            Self::RollbackCompleted => "rollback_completed",
            Self::RollbackFailed => "rollback_failed",
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type EventHandler = Arc<dyn Fn(&CollabEvent) + Send + Sync>;

type HandlerTable = HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>;

/// Synchronous named pub/sub.
pub struct EventBus {
    handlers: RwLock<HandlerTable>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe `handler` to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&CollabEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut table = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        table.entry(kind).or_default().push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut table = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        for subscribers in table.values_mut() {
            if let Some(pos) = subscribers.iter().position(|(sid, _)| *sid == id) {
                subscribers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver `event` to every subscriber of its kind.
    ///
    /// Returns the number of subscribers that completed without panicking.
    pub fn emit(&self, event: &CollabEvent) -> usize {
        let kind = event.kind();
        // Snapshot the list so handlers may subscribe/unsubscribe re-entrantly.
        let subscribers: Vec<EventHandler> = {
            let table = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            match table.get(&kind) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for handler in subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    log::error!(
                        "Subscriber for '{}' panicked: {}",
                        kind.name(),
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let table = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        table.get(&kind).map_or(0, Vec::len)
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.handlers.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
