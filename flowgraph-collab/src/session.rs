//! `CollabSession`: one user's live binding to one pipeline.
//!
//! ```text
//!                 ┌──────────────── CollabSession ────────────────┐
//!   UI calls ───► │ PipelineDocument ──on_update──► SyncProvider ─┼──► relay
//!                 │        │                 └────► LocalStore    │
//!   UI events ◄── │ EventBus ◄── AwarenessTracker ◄───────────────┼─── relay
//!                 └───────────────────────────────────────────────┘
//! ```
//!
//! Opening a session restores the pipeline from the local store (if one is
//! configured) before anything else runs, so the document is usable offline
//! immediately. Every local and remote update is appended to the store as a
//! delta; deltas are folded into a full snapshot once `compaction_threshold`
//! accumulate, on `checkpoint`, and on `destroy`.

use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

use flowgraph_core::{
    AwarenessMessage, AwarenessTracker, CollabError, CollabEvent, ConnectionStatus,
    CursorPosition, EventBus, EventKind, GraphData, Operation, PipelineDocument, PresenceState,
    PresenceStatus, SinkId, Snapshot, SubscriptionId, UpdateOrigin,
};

use crate::config::SessionConfig;
use crate::provider::SyncProvider;
use crate::storage::{document_key, DocumentMetadata, LocalStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Collab(#[from] CollabError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct CollabSession {
    config: SessionConfig,
    doc: Arc<PipelineDocument>,
    presence: Arc<Mutex<AwarenessTracker>>,
    provider: SyncProvider,
    store: Option<Arc<LocalStore>>,
    store_sink: Option<SinkId>,
}

impl CollabSession {
    /// Open a session, creating the configured local store if any.
    pub fn open(pipeline_id: &str, config: SessionConfig) -> Result<Self, SessionError> {
        let store = match &config.storage {
            Some(store_config) => Some(Arc::new(LocalStore::open(store_config.clone())?)),
            None => None,
        };
        Self::open_with_store(pipeline_id, config, store)
    }

    /// Open a session on an already opened store (shared between sessions
    /// of the same process).
    pub fn open_with_store(
        pipeline_id: &str,
        config: SessionConfig,
        store: Option<Arc<LocalStore>>,
    ) -> Result<Self, SessionError> {
        let bus = Arc::new(EventBus::new());
        let doc = Arc::new(PipelineDocument::new(
            pipeline_id,
            config.user_id.as_str(),
            bus,
            config.document_options(),
        ));

        let store_sink = match &store {
            Some(store) => {
                let key = document_key(pipeline_id);
                let updates = store.load_state(&key)?;
                if !updates.is_empty() {
                    let restored = doc.restore(&updates)?;
                    log::info!(
                        "Restored pipeline {pipeline_id} from {restored} persisted update(s)"
                    );
                }
                Some(attach_store(
                    &doc,
                    store.clone(),
                    key,
                    config.compaction_threshold,
                ))
            }
            None => None,
        };

        let presence = Arc::new(Mutex::new(AwarenessTracker::new(
            Uuid::new_v4(),
            config.user_id.as_str(),
            config.user_name.as_str(),
        )));
        let provider = SyncProvider::new(
            doc.clone(),
            presence.clone(),
            &config.user_name,
            config.provider_config(),
        );

        Ok(Self {
            config,
            doc,
            presence,
            provider,
            store,
            store_sink,
        })
    }

    pub fn pipeline_id(&self) -> &str {
        self.doc.pipeline_id()
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn session_id(&self) -> Uuid {
        self.provider.session_id()
    }

    pub fn document(&self) -> &Arc<PipelineDocument> {
        &self.doc
    }

    pub fn store(&self) -> Option<&Arc<LocalStore>> {
        self.store.as_ref()
    }

    // ─── Graph ────────────────────────────────────────────────────────

    pub fn add_node(&self, id: &str, data: Value) -> Result<bool, CollabError> {
        self.doc.add_node(id, data)
    }

    pub fn update_node(&self, id: &str, partial: Value) -> Result<bool, CollabError> {
        self.doc.update_node(id, partial)
    }

    pub fn delete_node(&self, id: &str) -> Result<bool, CollabError> {
        self.doc.delete_node(id)
    }

    pub fn add_edge(&self, id: &str, data: Value) -> Result<bool, CollabError> {
        self.doc.add_edge(id, data)
    }

    pub fn update_edge(&self, id: &str, partial: Value) -> Result<bool, CollabError> {
        self.doc.update_edge(id, partial)
    }

    pub fn delete_edge(&self, id: &str) -> Result<bool, CollabError> {
        self.doc.delete_edge(id)
    }

    pub fn get_current_data(&self) -> GraphData {
        self.doc.get_current_data()
    }

    // ─── History ──────────────────────────────────────────────────────

    pub fn create_snapshot(&self, description: &str) -> Result<Snapshot, CollabError> {
        self.doc.create_snapshot(description)
    }

    pub fn get_snapshots(&self) -> Vec<Snapshot> {
        self.doc.get_snapshots()
    }

    /// See [`PipelineDocument::rollback_to_snapshot`]; failures are also
    /// emitted as `RollbackFailed`.
    pub fn rollback_to_snapshot(&self, snapshot_id: &str) -> Result<Operation, CollabError> {
        self.doc.rollback_to_snapshot(snapshot_id)
    }

    // ─── Presence ─────────────────────────────────────────────────────

    pub fn update_cursor(&self, cursor: CursorPosition) {
        let message = self.with_presence(|t| t.update_cursor(cursor));
        self.broadcast_presence(&message);
    }

    pub fn clear_cursor(&self) {
        let message = self.with_presence(AwarenessTracker::clear_cursor);
        self.broadcast_presence(&message);
    }

    pub fn set_status(&self, status: PresenceStatus) {
        let message = self.with_presence(|t| t.set_status(status));
        self.broadcast_presence(&message);
    }

    /// Remote sessions currently present. The local user is not included.
    pub fn get_online_users(&self) -> Vec<PresenceState> {
        self.with_presence(|t| t.online_users())
    }

    pub fn local_presence(&self) -> PresenceState {
        self.with_presence(|t| t.local_state().clone())
    }

    fn with_presence<R>(&self, f: impl FnOnce(&mut AwarenessTracker) -> R) -> R {
        let mut tracker = self.presence.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut tracker)
    }

    fn broadcast_presence(&self, message: &AwarenessMessage) {
        if !self.provider.send_awareness(message) {
            log::trace!("Presence change kept local (offline)");
        }
    }

    // ─── Connection ───────────────────────────────────────────────────

    /// Connect to the relay at `server_url`. Resolves `false` on failure,
    /// leaving the session editable offline.
    pub async fn connect(&self, server_url: &str) -> bool {
        self.provider.connect(server_url, self.pipeline_id()).await
    }

    pub async fn disconnect(&self) {
        self.provider.disconnect().await;
    }

    pub fn get_connection_status(&self) -> ConnectionStatus {
        self.provider.status()
    }

    pub fn is_synced(&self) -> bool {
        self.provider.is_synced()
    }

    // ─── Events ───────────────────────────────────────────────────────

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&CollabEvent) + Send + Sync + 'static,
    {
        self.doc.bus().on(kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.doc.bus().off(id)
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Fold persisted deltas into one snapshot of the current state.
    /// `None` when the session has no local store.
    pub fn checkpoint(&self) -> Result<Option<DocumentMetadata>, SessionError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let key = document_key(self.pipeline_id());
        let through = store.current_version(&key)?;
        let metadata = store.compact(&key, &self.doc.encode_state(), through)?;
        Ok(Some(metadata))
    }

    /// Disconnect, persist, and release every listener.
    pub async fn destroy(mut self) -> Result<(), SessionError> {
        self.provider.disconnect().await;
        if let Some(sink) = self.store_sink.take() {
            self.doc.remove_update_sink(sink);
        }
        let result = self.checkpoint();
        self.doc.bus().clear();
        log::info!("Session {} on pipeline {} closed", self.session_id(), self.pipeline_id());
        result.map(|_| ())
    }
}

/// Append every local and remote update to `store` under `key`, compacting
/// once `threshold` deltas accumulate.
fn attach_store(
    doc: &Arc<PipelineDocument>,
    store: Arc<LocalStore>,
    key: String,
    threshold: u64,
) -> SinkId {
    let weak: Weak<PipelineDocument> = Arc::downgrade(doc);
    doc.on_update(move |update, origin| {
        if origin == UpdateOrigin::Persistence {
            return;
        }
        if let Err(e) = store.append_delta(&key, update) {
            log::error!("Failed to persist update for {key}: {e}");
            return;
        }
        let pending = match store.delta_count(&key) {
            Ok(n) => n,
            Err(e) => {
                log::error!("Failed to read delta count for {key}: {e}");
                return;
            }
        };
        if threshold == 0 || pending < threshold {
            return;
        }
        let Some(doc) = weak.upgrade() else {
            return;
        };
        let compacted = store
            .current_version(&key)
            .and_then(|through| store.compact(&key, &doc.encode_state(), through));
        match compacted {
            Ok(meta) => log::debug!(
                "Compacted {key}: {} bytes ({} compressed)",
                meta.snapshot_size,
                meta.compressed_size
            ),
            Err(e) => log::error!("Failed to compact {key}: {e}"),
        }
    })
}
