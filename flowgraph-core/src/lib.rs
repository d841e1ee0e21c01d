//! Collaborative editing core for directed pipeline graphs.
//!
//! ```text
//!   mutations ─▶ PipelineDocument (yrs) ─▶ update sinks ─▶ network / disk
//!                   │  nodes, edges
//!                   │  operations ─▶ OperationRecorder ─▶ auto snapshot
//!                   │  snapshots  ─▶ rollback
//!                   ▼
//!                EventBus ─▶ UI subscribers
//!
//!   AwarenessTracker (ephemeral, per session) ─▶ EventBus
//! ```
//!
//! This crate performs no I/O. Transport and durable storage live in
//! `flowgraph-collab`.

pub mod collab;
pub mod error;
pub mod events;
pub mod model;
pub mod presence;

pub use collab::{DocumentOptions, OperationRecorder, PipelineDocument, SinkId, UpdateOrigin, UpdateSink};
pub use error::CollabError;
pub use events::{CollabEvent, ConnectionStatus, EventBus, EventKind, SubscriptionId};
pub use model::{EdgeState, GraphData, NodeState, Operation, OperationKind, Snapshot};
pub use presence::{
    color_for_user, AwarenessMessage, AwarenessTracker, CursorPosition, PresenceChange,
    PresenceState, PresenceStatus,
};
