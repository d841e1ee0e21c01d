use yrs::{Array, ArrayRef, TransactionMut};

use crate::error::CollabError;
use crate::model::Operation;

/// Appends structured operation records to the shared operation log and
/// decides when an automatic snapshot is due.
///
/// Records are appended inside the caller's transaction so a mutation and its
/// record reach peers in the same update.
#[derive(Debug, Clone)]
pub struct OperationRecorder {
    threshold: u64,
}

impl OperationRecorder {
    pub const DEFAULT_THRESHOLD: u64 = 500;

    /// `threshold == 0` disables auto-snapshots.
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Call before the first write of a mutation: a serialization failure
    /// then returns while the transaction is still empty, so nothing
    /// half-written is committed.
    pub fn encode(&self, op: &Operation) -> Result<String, CollabError> {
        Ok(serde_json::to_string(op)?)
    }

    /// Append an encoded operation; returns the log length afterwards.
    pub fn record(&self, txn: &mut TransactionMut, log: &ArrayRef, encoded: String) -> u64 {
        log.push_back(txn, encoded);
        log.len(txn) as u64
    }

    pub fn should_auto_snapshot(&self, op_count: u64, last_snapshot_version: u64) -> bool {
        self.threshold > 0 && op_count.saturating_sub(last_snapshot_version) >= self.threshold
    }
}

impl Default for OperationRecorder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}
