//! Data model shared by every replica of a pipeline document.
//!
//! All records are stored inside the CRDT as JSON strings with camelCase
//! field names, so browser clients and Rust replicas read the same shapes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Metadata keys owned by the document store. Stripped from caller payloads.
pub const RESERVED_KEYS: &[&str] = &["createdAt", "createdBy", "updatedAt", "updatedBy"];

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A pipeline node: arbitrary config fields plus authorship stamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    /// Caller-defined config (label, position, type, ...).
    #[serde(flatten)]
    pub data: Map<String, Value>,
    pub created_at: u64,
    pub created_by: String,
    pub updated_at: u64,
    pub updated_by: String,
}

impl NodeState {
    /// Shorthand for a string config field.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// A directed connection between two node handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeState {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    /// Extra edge fields (label, animated, ...).
    #[serde(flatten)]
    pub data: Map<String, Value>,
    pub created_at: u64,
    pub created_by: String,
    pub updated_at: u64,
    pub updated_by: String,
}

/// Full materialized graph. Ordered maps so two converged replicas compare equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphData {
    pub nodes: BTreeMap<String, NodeState>,
    pub edges: BTreeMap<String, EdgeState>,
}

impl GraphData {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

/// Kind of a recorded mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    NodeAdd,
    NodeUpdate,
    NodeDelete,
    EdgeAdd,
    EdgeUpdate,
    EdgeDelete,
    /// Marker appended when current state is restored from a snapshot.
    Rollback,
}

impl OperationKind {
    pub fn is_node(self) -> bool {
        matches!(self, Self::NodeAdd | Self::NodeUpdate | Self::NodeDelete)
    }

    pub fn is_edge(self) -> bool {
        matches!(self, Self::EdgeAdd | Self::EdgeUpdate | Self::EdgeDelete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NodeAdd => "node_add",
            Self::NodeUpdate => "node_update",
            Self::NodeDelete => "node_delete",
            Self::EdgeAdd => "edge_add",
            Self::EdgeUpdate => "edge_update",
            Self::EdgeDelete => "edge_delete",
            Self::Rollback => "rollback",
        }
    }
}

/// One entry of the append-only operation log.
///
/// Cross-replica order is the log's merge order, not `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub user_id: String,
    pub timestamp: u64,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Operation {
    pub fn new(kind: OperationKind, user_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            user_id: user_id.into(),
            timestamp: now_millis(),
            data,
            metadata: None,
        }
    }

    /// Id of the node or edge this operation touched.
    pub fn target_id(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }
}

/// Point-in-time capture of the graph. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    /// Operation count observed at capture time.
    pub version: u64,
    pub timestamp: u64,
    pub user_id: String,
    pub description: String,
    pub data: GraphData,
    pub operations_since_last: u64,
}
