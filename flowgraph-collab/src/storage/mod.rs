//! Local durable storage for pipeline documents.
//!
//! ```text
//! ┌──────────────┐   updates    ┌──────────────────────────────────────┐
//! │ CollabSession│ ───────────► │ LocalStore (RocksDB)                 │
//! │ SyncServer   │              │  CF "documents": LZ4 full states     │
//! └──────┬───────┘              │  CF "deltas"   : LZ4 yrs updates     │
//!        │ load_state           │  CF "metadata" : version, sizes      │
//!        ▼                      └──────────────────────────────────────┘
//!  snapshot + deltas ─► PipelineDocument::restore
//! ```
//!
//! Every document is keyed by `pipeline-{pipeline_id}`.

pub mod rocks;

pub use rocks::{document_key, DocumentMetadata, LocalStore, StoreConfig, StoreError};
