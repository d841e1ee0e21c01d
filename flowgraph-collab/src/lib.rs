//! # flowgraph-collab: networked collaboration for pipeline graphs
//!
//! Binds a [`flowgraph_core::PipelineDocument`] to a WebSocket relay and to a
//! local durable store.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌─────────────┐
//! │ CollabSession │ ◄────────────────► │ SyncServer  │
//! │ SyncProvider  │    Binary Proto    │ (relay)     │
//! └──────┬────────┘                    └──────┬──────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌───────────────┐                    ┌─────────────┐
//! │ Pipeline doc  │                    │ Yrs Doc     │
//! │ + LocalStore  │                    │ per room    │
//! └───────────────┘                    └──────┬──────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │ BroadcastGroup│
//!                                     │ (fan-out)     │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Room-based fan-out with backpressure
//! - [`server`]: WebSocket relay
//! - [`provider`]: WebSocket sync provider (client side)
//! - [`storage`]: RocksDB persistence keyed `pipeline-{id}`
//! - [`session`]: One user's session on one pipeline

pub mod broadcast;
pub mod config;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod session;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use config::SessionConfig;
pub use protocol::{ConnectParams, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use provider::{ProviderConfig, SyncProvider};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{CollabSession, SessionError};
pub use storage::{document_key, DocumentMetadata, LocalStore, StoreConfig, StoreError};
