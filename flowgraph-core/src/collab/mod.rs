//! CRDT-backed pipeline document.
//!
//! One yrs `Doc` per collaborative session holds four shared types:
//!
//! ```text
//! ┌──────────────── yrs Doc ────────────────┐
//! │ Map   "nodes"      id → NodeState json  │
//! │ Map   "edges"      id → EdgeState json  │
//! │ Array "operations" Operation json       │  append-only
//! │ Array "snapshots"  Snapshot json        │  append-only
//! └─────────────────────────────────────────┘
//! ```
//!
//! Every mutation runs in a single transaction that writes the map entry and
//! appends its operation record, so peers never see one without the other.
//! Concurrent writes to the same key resolve last-writer-wins by the yrs
//! logical clock; writes to different keys always merge.

mod recorder;
mod snapshots;

pub use recorder::OperationRecorder;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use yrs::types::Change;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, Map, MapRef, Observable, Out, ReadTxn, StateVector, Transact,
    Update,
};

use crate::error::CollabError;
use crate::events::{CollabEvent, EventBus};
use crate::model::{
    now_millis, EdgeState, GraphData, NodeState, Operation, OperationKind, Snapshot,
    RESERVED_KEYS,
};

const NODES: &str = "nodes";
const EDGES: &str = "edges";
const OPERATIONS: &str = "operations";
const SNAPSHOTS: &str = "snapshots";

/// Tuning for a [`PipelineDocument`].
#[derive(Debug, Clone)]
pub struct DocumentOptions {
    /// Operations between automatic snapshots (0 disables).
    pub auto_snapshot_threshold: u64,
    /// Pin the replica id (deterministic tests). `None` = random.
    pub client_id: Option<u64>,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            auto_snapshot_threshold: OperationRecorder::DEFAULT_THRESHOLD,
            client_id: None,
        }
    }
}

/// Where an encoded update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by a mutation on this replica.
    Local,
    /// Received from a peer.
    Remote,
    /// Replayed from local durable storage.
    Persistence,
}

/// Receives every encoded update together with its origin.
pub type UpdateSink = Arc<dyn Fn(&[u8], UpdateOrigin) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// Static description of one of the two entity maps.
struct Collection<'a> {
    map: &'a MapRef,
    name: &'static str,
    field: &'static str,
    add: OperationKind,
    update: OperationKind,
    delete: OperationKind,
}

/// The replicated document store for one pipeline.
pub struct PipelineDocument {
    pipeline_id: String,
    user_id: String,
    doc: Doc,
    nodes: MapRef,
    edges: MapRef,
    operations: ArrayRef,
    snapshots: ArrayRef,
    recorder: OperationRecorder,
    bus: Arc<EventBus>,
    /// Events gathered by observers during a commit, emitted after it.
    pending: Arc<Mutex<Vec<CollabEvent>>>,
    /// Suppresses event delivery while replaying persisted state.
    muted: Arc<AtomicBool>,
    last_snapshot_version: Arc<AtomicU64>,
    sinks: RwLock<Vec<(SinkId, UpdateSink)>>,
    next_sink: AtomicU64,
    _subscriptions: Vec<yrs::Subscription>,
}

impl PipelineDocument {
    pub fn new(
        pipeline_id: impl Into<String>,
        user_id: impl Into<String>,
        bus: Arc<EventBus>,
        options: DocumentOptions,
    ) -> Self {
        let doc = match options.client_id {
            Some(id) => Doc::with_client_id(id),
            None => Doc::new(),
        };
        let nodes = doc.get_or_insert_map(NODES);
        let edges = doc.get_or_insert_map(EDGES);
        let operations = doc.get_or_insert_array(OPERATIONS);
        let snapshots = doc.get_or_insert_array(SNAPSHOTS);

        let pending = Arc::new(Mutex::new(Vec::new()));
        let muted = Arc::new(AtomicBool::new(false));
        let last_snapshot_version = Arc::new(AtomicU64::new(0));

        let ops_sub = {
            let pending = pending.clone();
            let muted = muted.clone();
            operations.observe(move |txn, event| {
                if muted.load(Ordering::SeqCst) {
                    return;
                }
                let mut queue = pending.lock().unwrap_or_else(|e| e.into_inner());
                for change in event.delta(txn) {
                    if let Change::Added(values) = change {
                        for value in values {
                            match decode_out::<Operation>(value, OPERATIONS) {
                                Ok(op) => queue.push(operation_event(op)),
                                Err(e) => log::warn!("Skipping undecodable operation: {e}"),
                            }
                        }
                    }
                }
            })
        };

        let snapshots_sub = {
            let pending = pending.clone();
            let muted = muted.clone();
            let last = last_snapshot_version.clone();
            snapshots.observe(move |txn, event| {
                let mut queue = pending.lock().unwrap_or_else(|e| e.into_inner());
                for change in event.delta(txn) {
                    if let Change::Added(values) = change {
                        for value in values {
                            match decode_out::<Snapshot>(value, SNAPSHOTS) {
                                Ok(snapshot) => {
                                    last.fetch_max(snapshot.version, Ordering::SeqCst);
                                    if !muted.load(Ordering::SeqCst) {
                                        queue.push(CollabEvent::SnapshotCreated(snapshot));
                                    }
                                }
                                Err(e) => log::warn!("Skipping undecodable snapshot: {e}"),
                            }
                        }
                    }
                }
            })
        };

        Self {
            pipeline_id: pipeline_id.into(),
            user_id: user_id.into(),
            doc,
            nodes,
            edges,
            operations,
            snapshots,
            recorder: OperationRecorder::new(options.auto_snapshot_threshold),
            bus,
            pending,
            muted,
            last_snapshot_version,
            sinks: RwLock::new(Vec::new()),
            next_sink: AtomicU64::new(1),
            _subscriptions: vec![ops_sub, snapshots_sub],
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// yrs replica id of this document.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // ─── Node / edge mutations ────────────────────────────────────────

    /// Insert (or overwrite) a node. Returns `false` when the stored config
    /// already equals `data`, in which case nothing is written.
    pub fn add_node(&self, id: &str, data: Value) -> Result<bool, CollabError> {
        self.add_entry::<NodeState>(&self.node_collection(), id, data)
    }

    /// Shallow-merge `partial` into an existing node. Missing ids are ignored
    /// and reported as `Ok(false)`.
    pub fn update_node(&self, id: &str, partial: Value) -> Result<bool, CollabError> {
        self.update_entry::<NodeState>(&self.node_collection(), id, partial)
    }

    pub fn delete_node(&self, id: &str) -> Result<bool, CollabError> {
        self.delete_entry(&self.node_collection(), id)
    }

    /// Insert (or overwrite) an edge. `data` must carry `source` and `target`.
    pub fn add_edge(&self, id: &str, data: Value) -> Result<bool, CollabError> {
        self.add_entry::<EdgeState>(&self.edge_collection(), id, data)
    }

    pub fn update_edge(&self, id: &str, partial: Value) -> Result<bool, CollabError> {
        self.update_entry::<EdgeState>(&self.edge_collection(), id, partial)
    }

    pub fn delete_edge(&self, id: &str) -> Result<bool, CollabError> {
        self.delete_entry(&self.edge_collection(), id)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Materialize the current nodes and edges.
    pub fn get_current_data(&self) -> GraphData {
        let txn = self.doc.transact();
        self.collect_graph(&txn)
    }

    pub fn get_node(&self, id: &str) -> Option<NodeState> {
        let txn = self.doc.transact();
        self.nodes
            .get(&txn, id)
            .and_then(|out| decode_out(&out, NODES).ok())
    }

    pub fn get_edge(&self, id: &str) -> Option<EdgeState> {
        let txn = self.doc.transact();
        self.edges
            .get(&txn, id)
            .and_then(|out| decode_out(&out, EDGES).ok())
    }

    pub fn operation_count(&self) -> u64 {
        let txn = self.doc.transact();
        self.operations.len(&txn) as u64
    }

    /// The operation log in merge order.
    pub fn operations(&self) -> Vec<Operation> {
        let txn = self.doc.transact();
        decode_array(&self.operations, &txn, OPERATIONS)
    }

    /// Version of the newest snapshot seen by this replica (0 if none).
    pub fn last_snapshot_version(&self) -> u64 {
        self.last_snapshot_version.load(Ordering::SeqCst)
    }

    pub fn auto_snapshot_threshold(&self) -> u64 {
        self.recorder.threshold()
    }

    // ─── Replication ──────────────────────────────────────────────────

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Whole document as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything this replica has that `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CollabError> {
        let remote_sv = StateVector::decode_v1(state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    /// Merge an update from a peer or from storage.
    ///
    /// Merging is commutative and idempotent: the same update applied twice,
    /// or updates applied in any order, converge to the same state.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), CollabError> {
        let decoded = Update::decode_v1(update)?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| CollabError::Crdt(e.to_string()))?;
        }
        self.dispatch_update(update, origin);
        self.flush_events();
        Ok(())
    }

    /// Replay persisted updates without notifying subscribers or sinks.
    pub fn restore(&self, updates: &[Vec<u8>]) -> Result<usize, CollabError> {
        self.muted.store(true, Ordering::SeqCst);
        let result = updates.iter().try_for_each(|bytes| {
            let decoded = Update::decode_v1(bytes)?;
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| CollabError::Crdt(e.to_string()))
        });
        self.muted.store(false, Ordering::SeqCst);
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        result.map(|()| updates.len())
    }

    /// Register a sink for encoded updates.
    pub fn on_update<F>(&self, sink: F) -> SinkId
    where
        F: Fn(&[u8], UpdateOrigin) + Send + Sync + 'static,
    {
        let id = SinkId(self.next_sink.fetch_add(1, Ordering::Relaxed));
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(sink)));
        id
    }

    pub fn remove_update_sink(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        let before = sinks.len();
        sinks.retain(|(sid, _)| *sid != id);
        sinks.len() != before
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn node_collection(&self) -> Collection<'_> {
        Collection {
            map: &self.nodes,
            name: NODES,
            field: "node",
            add: OperationKind::NodeAdd,
            update: OperationKind::NodeUpdate,
            delete: OperationKind::NodeDelete,
        }
    }

    fn edge_collection(&self) -> Collection<'_> {
        Collection {
            map: &self.edges,
            name: EDGES,
            field: "edge",
            add: OperationKind::EdgeAdd,
            update: OperationKind::EdgeUpdate,
            delete: OperationKind::EdgeDelete,
        }
    }

    fn add_entry<T>(&self, coll: &Collection<'_>, id: &str, data: Value) -> Result<bool, CollabError>
    where
        T: Serialize + DeserializeOwned,
    {
        let fields = payload_object(coll.name, data)?;
        let update = {
            let mut txn = self.doc.transact_mut();
            let now = now_millis();
            let existing = read_object(coll.map, &txn, id, coll.name)?;

            let (created_at, created_by) = match &existing {
                Some(prev) => (
                    prev.get("createdAt").cloned().unwrap_or(Value::from(now)),
                    prev.get("createdBy")
                        .cloned()
                        .unwrap_or(Value::from(self.user_id.as_str())),
                ),
                None => (Value::from(now), Value::from(self.user_id.as_str())),
            };

            let mut object = fields;
            object.insert("createdAt".into(), created_at);
            object.insert("createdBy".into(), created_by);
            object.insert("updatedAt".into(), Value::from(now));
            object.insert("updatedBy".into(), Value::from(self.user_id.as_str()));

            let entry: T = serde_json::from_value(Value::Object(object))
                .map_err(|e| CollabError::InvalidPayload(format!("{} '{id}': {e}", coll.field)))?;
            let entry_value = serde_json::to_value(&entry)?;

            // Compare record shapes, not raw payloads: the record type drops
            // absent optionals, so `null` and a missing key are the same edit.
            if let Some(prev) = existing {
                let same = match (&entry_value, canonical::<T>(prev)) {
                    (Value::Object(next), Some(prev)) => strip_reserved(next.clone()) == prev,
                    _ => false,
                };
                if same {
                    return Ok(false);
                }
            }
            let encoded = serde_json::to_string(&entry)?;

            let mut op_data = JsonMap::new();
            op_data.insert("id".into(), Value::from(id));
            op_data.insert(coll.field.into(), entry_value);
            let op = Operation::new(coll.add, self.user_id.as_str(), Value::Object(op_data));
            let op_encoded = self.recorder.encode(&op)?;

            coll.map.insert(&mut txn, id, encoded);
            self.recorder.record(&mut txn, &self.operations, op_encoded);
            txn.encode_update_v1()
        };
        self.finish_commit(&update);
        self.maybe_auto_snapshot();
        Ok(true)
    }

    fn update_entry<T>(
        &self,
        coll: &Collection<'_>,
        id: &str,
        partial: Value,
    ) -> Result<bool, CollabError>
    where
        T: Serialize + DeserializeOwned,
    {
        let patch = payload_object(coll.name, partial)?;
        let update = {
            let mut txn = self.doc.transact_mut();
            let Some(mut object) = read_object(coll.map, &txn, id, coll.name)? else {
                log::debug!("Ignoring update of missing {} '{id}'", coll.field);
                return Ok(false);
            };

            object.extend(patch.clone());
            object.insert("updatedAt".into(), Value::from(now_millis()));
            object.insert("updatedBy".into(), Value::from(self.user_id.as_str()));

            let entry: T = serde_json::from_value(Value::Object(object))
                .map_err(|e| CollabError::InvalidPayload(format!("{} '{id}': {e}", coll.field)))?;
            let encoded = serde_json::to_string(&entry)?;

            let mut op_data = JsonMap::new();
            op_data.insert("id".into(), Value::from(id));
            op_data.insert("changes".into(), Value::Object(patch));
            op_data.insert(coll.field.into(), serde_json::to_value(&entry)?);
            let op = Operation::new(coll.update, self.user_id.as_str(), Value::Object(op_data));
            let op_encoded = self.recorder.encode(&op)?;

            coll.map.insert(&mut txn, id, encoded);
            self.recorder.record(&mut txn, &self.operations, op_encoded);
            txn.encode_update_v1()
        };
        self.finish_commit(&update);
        self.maybe_auto_snapshot();
        Ok(true)
    }

    fn delete_entry(&self, coll: &Collection<'_>, id: &str) -> Result<bool, CollabError> {
        let op = Operation::new(
            coll.delete,
            self.user_id.as_str(),
            serde_json::json!({ "id": id }),
        );
        let op_encoded = self.recorder.encode(&op)?;
        let update = {
            let mut txn = self.doc.transact_mut();
            if !coll.map.contains_key(&txn, id) {
                log::debug!("Ignoring delete of missing {} '{id}'", coll.field);
                return Ok(false);
            }
            coll.map.remove(&mut txn, id);
            self.recorder.record(&mut txn, &self.operations, op_encoded);
            txn.encode_update_v1()
        };
        self.finish_commit(&update);
        self.maybe_auto_snapshot();
        Ok(true)
    }

    fn collect_graph<T: ReadTxn>(&self, txn: &T) -> GraphData {
        let mut data = GraphData::default();
        for (key, value) in self.nodes.iter(txn) {
            match decode_out::<NodeState>(&value, NODES) {
                Ok(node) => {
                    data.nodes.insert(key.to_string(), node);
                }
                Err(e) => log::warn!("Skipping node '{key}': {e}"),
            }
        }
        for (key, value) in self.edges.iter(txn) {
            match decode_out::<EdgeState>(&value, EDGES) {
                Ok(edge) => {
                    data.edges.insert(key.to_string(), edge);
                }
                Err(e) => log::warn!("Skipping edge '{key}': {e}"),
            }
        }
        data
    }

    /// Forward a committed local update to sinks and deliver queued events.
    fn finish_commit(&self, update: &[u8]) {
        self.dispatch_update(update, UpdateOrigin::Local);
        self.flush_events();
    }

    fn dispatch_update(&self, update: &[u8], origin: UpdateOrigin) {
        let sinks: Vec<UpdateSink> = self
            .sinks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        for sink in sinks {
            sink(update, origin);
        }
    }

    fn flush_events(&self) {
        let events: Vec<CollabEvent> = {
            let mut queue = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *queue)
        };
        for event in &events {
            self.bus.emit(event);
        }
    }

    fn maybe_auto_snapshot(&self) {
        let count = self.operation_count();
        if self
            .recorder
            .should_auto_snapshot(count, self.last_snapshot_version())
        {
            log::info!(
                "Auto snapshot of pipeline {} at {count} operations",
                self.pipeline_id
            );
            if let Err(e) = self.create_snapshot("auto") {
                log::error!("Auto snapshot failed for pipeline {}: {e}", self.pipeline_id);
            }
        }
    }
}

fn operation_event(op: Operation) -> CollabEvent {
    if op.kind == OperationKind::Rollback {
        CollabEvent::RollbackCompleted(op)
    } else if op.kind.is_edge() {
        CollabEvent::EdgeChanged(op)
    } else {
        CollabEvent::NodeChanged(op)
    }
}

/// Borrow the JSON text stored in a shared-type slot.
fn out_json<'a>(value: &'a Out, collection: &'static str) -> Result<&'a str, CollabError> {
    match value {
        Out::Any(Any::String(json)) => Ok(json.as_ref()),
        _ => Err(CollabError::Corrupt {
            collection,
            reason: "expected a JSON string".into(),
        }),
    }
}

fn decode_out<T: DeserializeOwned>(value: &Out, collection: &'static str) -> Result<T, CollabError> {
    let json = out_json(value, collection)?;
    serde_json::from_str(json).map_err(|e| CollabError::Corrupt {
        collection,
        reason: e.to_string(),
    })
}

fn decode_array<T: DeserializeOwned, R: ReadTxn>(
    array: &ArrayRef,
    txn: &R,
    collection: &'static str,
) -> Vec<T> {
    array
        .iter(txn)
        .filter_map(|value| match decode_out(&value, collection) {
            Ok(item) => Some(item),
            Err(e) => {
                log::warn!("Skipping entry in {collection}: {e}");
                None
            }
        })
        .collect()
}

fn read_object<R: ReadTxn>(
    map: &MapRef,
    txn: &R,
    id: &str,
    collection: &'static str,
) -> Result<Option<JsonMap<String, Value>>, CollabError> {
    let Some(value) = map.get(txn, id) else {
        return Ok(None);
    };
    match decode_out::<Value>(&value, collection)? {
        Value::Object(object) => Ok(Some(object)),
        _ => Err(CollabError::Corrupt {
            collection,
            reason: format!("entry '{id}' is not an object"),
        }),
    }
}

/// Caller payloads must be JSON objects; reserved metadata keys are dropped.
fn payload_object(collection: &'static str, data: Value) -> Result<JsonMap<String, Value>, CollabError> {
    match data {
        Value::Object(object) => Ok(strip_reserved(object)),
        other => Err(CollabError::InvalidPayload(format!(
            "{collection} payload must be an object, got {other}"
        ))),
    }
}

/// Re-shape a stored record through its type and drop the bookkeeping
/// stamps. `None` if the stored value no longer fits the type.
fn canonical<T>(object: JsonMap<String, Value>) -> Option<JsonMap<String, Value>>
where
    T: Serialize + DeserializeOwned,
{
    let entry: T = serde_json::from_value(Value::Object(object)).ok()?;
    match serde_json::to_value(&entry).ok()? {
        Value::Object(object) => Some(strip_reserved(object)),
        _ => None,
    }
}

fn strip_reserved(mut object: JsonMap<String, Value>) -> JsonMap<String, Value> {
    for key in RESERVED_KEYS {
        object.remove(*key);
    }
    object
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use serde_json::json;

    fn document(user: &str, client_id: u64) -> PipelineDocument {
        PipelineDocument::new(
            "p1",
            user,
            Arc::new(EventBus::new()),
            DocumentOptions {
                client_id: Some(client_id),
                ..DocumentOptions::default()
            },
        )
    }

    fn sync(from: &PipelineDocument, to: &PipelineDocument) {
        let diff = from.encode_diff(&to.state_vector()).unwrap();
        to.apply_update(&diff, UpdateOrigin::Remote).unwrap();
    }

    #[test]
    fn test_add_node_stamps_authorship() {
        let doc = document("alice", 1);
        assert!(doc.add_node("n1", json!({ "label": "Start" })).unwrap());

        let node = doc.get_node("n1").unwrap();
        assert_eq!(node.field_str("label"), Some("Start"));
        assert_eq!(node.created_by, "alice");
        assert_eq!(node.updated_by, "alice");
        assert!(node.created_at > 0);
        assert_eq!(doc.operation_count(), 1);
        assert_eq!(doc.operations()[0].kind, OperationKind::NodeAdd);
    }

    #[test]
    fn test_identical_add_is_noop() {
        let doc = document("alice", 1);
        doc.add_node("n1", json!({ "label": "Start" })).unwrap();
        let before = doc.get_current_data();

        assert!(!doc.add_node("n1", json!({ "label": "Start" })).unwrap());
        assert_eq!(doc.get_current_data(), before);
        assert_eq!(doc.operation_count(), 1);
    }

    #[test]
    fn test_identical_edge_with_null_handles_is_noop() {
        let doc = document("alice", 1);
        let edge = json!({
            "source": "a",
            "target": "b",
            "sourceHandle": null,
            "targetHandle": null,
        });
        assert!(doc.add_edge("e1", edge.clone()).unwrap());
        let stamped = doc.get_edge("e1").unwrap().updated_at;

        assert!(!doc.add_edge("e1", edge).unwrap());
        assert!(!doc.add_edge("e1", json!({ "source": "a", "target": "b" })).unwrap());
        assert_eq!(doc.get_edge("e1").unwrap().updated_at, stamped);
        assert_eq!(doc.operation_count(), 1);

        // A real change still goes through.
        assert!(doc
            .add_edge("e1", json!({ "source": "a", "target": "b", "sourceHandle": "out" }))
            .unwrap());
        assert_eq!(doc.operation_count(), 2);
    }

    #[test]
    fn test_document_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineDocument>();
        assert_send_sync::<Arc<PipelineDocument>>();
    }

    #[test]
    fn test_overwrite_keeps_creation_stamp() {
        let alice = document("alice", 1);
        let bob = document("bob", 2);
        alice.add_node("n1", json!({ "label": "Start" })).unwrap();
        sync(&alice, &bob);

        bob.add_node("n1", json!({ "label": "Other" })).unwrap();
        let node = bob.get_node("n1").unwrap();
        assert_eq!(node.created_by, "alice");
        assert_eq!(node.updated_by, "bob");
        assert_eq!(node.field_str("label"), Some("Other"));
    }

    #[test]
    fn test_reserved_keys_are_stripped() {
        let doc = document("alice", 1);
        doc.add_node("n1", json!({ "label": "x", "createdBy": "mallory" }))
            .unwrap();
        assert_eq!(doc.get_node("n1").unwrap().created_by, "alice");
    }

    #[test]
    fn test_update_merges_shallowly() {
        let doc = document("alice", 1);
        doc.add_node("n1", json!({ "label": "Start", "x": 10 })).unwrap();
        assert!(doc.update_node("n1", json!({ "label": "Begin" })).unwrap());

        let node = doc.get_node("n1").unwrap();
        assert_eq!(node.field_str("label"), Some("Begin"));
        assert_eq!(node.data["x"], 10);

        let ops = doc.operations();
        assert_eq!(ops[1].kind, OperationKind::NodeUpdate);
        assert_eq!(ops[1].data["changes"]["label"], "Begin");
    }

    #[test]
    fn test_missing_entities_are_ignored() {
        let doc = document("alice", 1);
        assert!(!doc.update_node("ghost", json!({ "label": "x" })).unwrap());
        assert!(!doc.update_edge("ghost", json!({ "label": "x" })).unwrap());
        assert!(!doc.delete_node("ghost").unwrap());
        assert!(!doc.delete_edge("ghost").unwrap());
        assert!(doc.get_current_data().is_empty());
        assert_eq!(doc.operation_count(), 0);
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let doc = document("alice", 1);
        let err = doc.add_node("n1", json!("just a string")).unwrap_err();
        assert!(matches!(err, CollabError::InvalidPayload(_)));
        assert_eq!(doc.operation_count(), 0);
    }

    #[test]
    fn test_edge_lifecycle() {
        let doc = document("alice", 1);
        doc.add_node("a", json!({})).unwrap();
        doc.add_node("b", json!({})).unwrap();

        doc.add_edge(
            "e1",
            json!({ "source": "a", "target": "b", "sourceHandle": "out" }),
        )
        .unwrap();
        let edge = doc.get_edge("e1").unwrap();
        assert_eq!(edge.source, "a");
        assert_eq!(edge.source_handle.as_deref(), Some("out"));

        doc.update_edge("e1", json!({ "targetHandle": "in", "label": "data" }))
            .unwrap();
        let edge = doc.get_edge("e1").unwrap();
        assert_eq!(edge.target_handle.as_deref(), Some("in"));
        assert_eq!(edge.data["label"], "data");

        assert!(doc.delete_edge("e1").unwrap());
        assert!(doc.get_edge("e1").is_none());
        assert_eq!(doc.operations().last().unwrap().kind, OperationKind::EdgeDelete);
    }

    #[test]
    fn test_edge_without_endpoints_rejected() {
        let doc = document("alice", 1);
        let err = doc.add_edge("e1", json!({ "source": "a" })).unwrap_err();
        assert!(matches!(err, CollabError::InvalidPayload(_)));
        assert!(doc.get_edge("e1").is_none());
        assert_eq!(doc.operation_count(), 0);
    }

    #[test]
    fn test_events_fire_once_per_mutation() {
        let doc = document("alice", 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        doc.bus().on(EventKind::NodeChanged, move |e| {
            s.lock().unwrap().push(e.clone());
        });
        let s = seen.clone();
        doc.bus().on(EventKind::EdgeChanged, move |e| {
            s.lock().unwrap().push(e.clone());
        });

        doc.add_node("n1", json!({ "label": "a" })).unwrap();
        doc.add_edge("e1", json!({ "source": "n1", "target": "n1" }))
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[0], CollabEvent::NodeChanged(op) if op.target_id() == Some("n1")));
        assert!(matches!(&seen[1], CollabEvent::EdgeChanged(op) if op.kind == OperationKind::EdgeAdd));
    }

    #[test]
    fn test_remote_changes_emit_events() {
        let alice = document("alice", 1);
        let bob = document("bob", 2);
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        bob.bus().on(EventKind::NodeChanged, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        alice.add_node("n1", json!({})).unwrap();
        alice.add_node("n2", json!({})).unwrap();
        sync(&alice, &bob);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_may_read_document() {
        let doc = Arc::new(document("alice", 1));
        let counts = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&doc);
        let c = counts.clone();
        doc.bus().on(EventKind::NodeChanged, move |_| {
            if let Some(doc) = weak.upgrade() {
                c.lock().unwrap().push(doc.get_current_data().nodes.len());
            }
        });

        doc.add_node("n1", json!({})).unwrap();
        doc.add_node("n2", json!({})).unwrap();
        assert_eq!(*counts.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_update_sinks_receive_origin() {
        let alice = document("alice", 1);
        let bob = document("bob", 2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let id = bob.on_update(move |bytes, origin| {
            s.lock().unwrap().push((bytes.len(), origin));
        });

        bob.add_node("local", json!({})).unwrap();
        alice.add_node("remote", json!({})).unwrap();
        sync(&alice, &bob);

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[0].1, UpdateOrigin::Local);
            assert_eq!(seen[1].1, UpdateOrigin::Remote);
            assert!(seen.iter().all(|(len, _)| *len > 0));
        }

        assert!(bob.remove_update_sink(id));
        assert!(!bob.remove_update_sink(id));
        bob.add_node("after", json!({})).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_restore_is_silent() {
        let source = document("alice", 1);
        source.add_node("n1", json!({ "label": "persisted" })).unwrap();
        let state = source.encode_state();

        let target = document("alice", 3);
        let fired = Arc::new(AtomicU64::new(0));
        let f = fired.clone();
        target.bus().on(EventKind::NodeChanged, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(target.restore(&[state]).unwrap(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(target.get_current_data(), source.get_current_data());
    }

    #[test]
    fn test_garbage_update_rejected() {
        let doc = document("alice", 1);
        assert!(doc.apply_update(&[0xFF, 0x00, 0x13], UpdateOrigin::Remote).is_err());
        assert!(doc.encode_diff(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_duplicate_update_is_idempotent() {
        let alice = document("alice", 1);
        let bob = document("bob", 2);
        alice.add_node("n1", json!({ "label": "x" })).unwrap();
        let state = alice.encode_state();

        bob.apply_update(&state, UpdateOrigin::Remote).unwrap();
        let once = bob.get_current_data();
        bob.apply_update(&state, UpdateOrigin::Remote).unwrap();

        assert_eq!(bob.get_current_data(), once);
        assert_eq!(bob.operation_count(), 1);
    }
}
