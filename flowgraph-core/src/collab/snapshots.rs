//! Point-in-time captures and non-destructive rollback.
//!
//! Snapshots live in an append-only shared array. Rolling back rewrites the
//! node and edge maps from a capture and appends a `rollback` marker to the
//! operation log; neither log ever shrinks.

use serde_json::json;
use std::sync::atomic::Ordering;
use uuid::Uuid;
use yrs::{Array, Map, Transact};

use super::{decode_array, PipelineDocument, SNAPSHOTS};
use crate::error::CollabError;
use crate::events::CollabEvent;
use crate::model::{now_millis, Operation, OperationKind, Snapshot};

impl PipelineDocument {
    /// Capture the current graph and append it to the snapshot log.
    pub fn create_snapshot(&self, description: &str) -> Result<Snapshot, CollabError> {
        let (snapshot, update) = {
            let mut txn = self.doc.transact_mut();
            let version = self.operations.len(&txn) as u64;
            let previous = self.last_snapshot_version.load(Ordering::SeqCst);

            let snapshot = Snapshot {
                id: Uuid::new_v4().to_string(),
                version,
                timestamp: now_millis(),
                user_id: self.user_id.clone(),
                description: description.to_string(),
                data: self.collect_graph(&txn),
                operations_since_last: version.saturating_sub(previous),
            };
            let encoded = serde_json::to_string(&snapshot)?;
            self.snapshots.push_back(&mut txn, encoded);
            (snapshot, txn.encode_update_v1())
        };

        log::info!(
            "Snapshot {} '{}' of pipeline {} at version {}",
            snapshot.id,
            snapshot.description,
            self.pipeline_id,
            snapshot.version
        );
        self.finish_commit(&update);
        Ok(snapshot)
    }

    /// Every snapshot in append order.
    pub fn get_snapshots(&self) -> Vec<Snapshot> {
        let txn = self.doc.transact();
        decode_array(&self.snapshots, &txn, SNAPSHOTS)
    }

    /// Replace the current nodes and edges with those captured by
    /// `snapshot_id`. Returns the rollback marker operation.
    ///
    /// Failure leaves the graph untouched and is also announced as
    /// [`CollabEvent::RollbackFailed`].
    pub fn rollback_to_snapshot(&self, snapshot_id: &str) -> Result<Operation, CollabError> {
        match self.try_rollback(snapshot_id) {
            Ok(op) => {
                log::info!(
                    "Pipeline {} rolled back to snapshot {snapshot_id}",
                    self.pipeline_id
                );
                self.maybe_auto_snapshot();
                Ok(op)
            }
            Err(e) => {
                log::warn!(
                    "Rollback of pipeline {} to {snapshot_id} failed: {e}",
                    self.pipeline_id
                );
                self.bus.emit(&CollabEvent::RollbackFailed {
                    snapshot_id: snapshot_id.to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn try_rollback(&self, snapshot_id: &str) -> Result<Operation, CollabError> {
        let snapshot = self
            .get_snapshots()
            .into_iter()
            .find(|s| s.id == snapshot_id)
            .ok_or_else(|| CollabError::SnapshotNotFound(snapshot_id.to_string()))?;

        let nodes = snapshot
            .data
            .nodes
            .iter()
            .map(|(id, node)| Ok((id.clone(), serde_json::to_string(node)?)))
            .collect::<Result<Vec<_>, CollabError>>()?;
        let edges = snapshot
            .data
            .edges
            .iter()
            .map(|(id, edge)| Ok((id.clone(), serde_json::to_string(edge)?)))
            .collect::<Result<Vec<_>, CollabError>>()?;

        let (op, update) = {
            let mut txn = self.doc.transact_mut();
            let previous_version = self.operations.len(&txn) as u64;
            let op = Operation::new(
                OperationKind::Rollback,
                self.user_id.as_str(),
                json!({
                    "snapshotId": snapshot.id,
                    "previousVersion": previous_version,
                    "targetVersion": snapshot.version,
                }),
            );
            let op_encoded = self.recorder.encode(&op)?;

            self.nodes.clear(&mut txn);
            self.edges.clear(&mut txn);
            for (id, json) in nodes {
                self.nodes.insert(&mut txn, id, json);
            }
            for (id, json) in edges {
                self.edges.insert(&mut txn, id, json);
            }
            self.recorder
                .record(&mut txn, &self.operations, op_encoded);
            (op, txn.encode_update_v1())
        };

        self.finish_commit(&update);
        Ok(op)
    }
}
