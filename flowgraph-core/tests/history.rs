//! Snapshot, rollback and authorship behaviour across replicas.

use std::sync::Arc;

use flowgraph_core::{
    CollabError, DocumentOptions, EventBus, OperationKind, PipelineDocument, UpdateOrigin,
};
use serde_json::json;

fn session(user: &str, client_id: u64) -> PipelineDocument {
    PipelineDocument::new(
        "pipeline-1",
        user,
        Arc::new(EventBus::new()),
        DocumentOptions {
            client_id: Some(client_id),
            ..DocumentOptions::default()
        },
    )
}

fn sync_both(a: &PipelineDocument, b: &PipelineDocument) {
    let to_b = a.encode_diff(&b.state_vector()).unwrap();
    let to_a = b.encode_diff(&a.state_vector()).unwrap();
    b.apply_update(&to_b, UpdateOrigin::Remote).unwrap();
    a.apply_update(&to_a, UpdateOrigin::Remote).unwrap();
}

#[test]
fn update_after_sync_keeps_creator_and_records_editor() {
    let a = session("user-a", 1);
    let b = session("user-b", 2);

    a.add_node("n1", json!({ "label": "Start" })).unwrap();
    sync_both(&a, &b);
    b.update_node("n1", json!({ "label": "Begin" })).unwrap();
    sync_both(&a, &b);

    for doc in [&a, &b] {
        let node = doc.get_node("n1").unwrap();
        assert_eq!(node.field_str("label"), Some("Begin"));
        assert_eq!(node.created_by, "user-a");
        assert_eq!(node.updated_by, "user-b");
    }
}

#[test]
fn exactly_one_auto_snapshot_after_500_operations() {
    let doc = session("user-a", 1);
    for i in 0..500 {
        doc.add_node(&format!("n{i}"), json!({ "index": i })).unwrap();
    }

    let snapshots = doc.get_snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].version, 500);
    assert_eq!(snapshots[0].description, "auto");
    assert_eq!(snapshots[0].operations_since_last, 500);
    assert_eq!(snapshots[0].data.nodes.len(), 500);
}

#[test]
fn rollback_never_truncates_history() {
    let doc = session("user-a", 1);
    doc.add_node("a", json!({ "label": "A" })).unwrap();
    let early = doc.create_snapshot("early").unwrap();

    doc.add_node("b", json!({ "label": "B" })).unwrap();
    doc.add_edge("ab", json!({ "source": "a", "target": "b" }))
        .unwrap();
    let late = doc.create_snapshot("late").unwrap();
    let ops_before = doc.operation_count();

    doc.rollback_to_snapshot(&early.id).unwrap();

    let ids: Vec<String> = doc.get_snapshots().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![early.id.clone(), late.id.clone()]);
    assert_eq!(doc.operation_count(), ops_before + 1);
    assert_eq!(doc.get_current_data(), early.data);

    // Rolling forward again is just another edit.
    doc.rollback_to_snapshot(&late.id).unwrap();
    assert_eq!(doc.get_current_data(), late.data);
    assert_eq!(doc.operation_count(), ops_before + 2);
    let kinds: Vec<OperationKind> = doc.operations().into_iter().map(|op| op.kind).collect();
    assert_eq!(&kinds[kinds.len() - 2..], &[OperationKind::Rollback, OperationKind::Rollback]);
}

#[test]
fn rollback_to_missing_snapshot_leaves_graph_unchanged() {
    let doc = session("user-a", 1);
    doc.add_node("n1", json!({ "label": "Start" })).unwrap();
    let before = doc.get_current_data();

    let result = doc.rollback_to_snapshot("missing");
    assert!(matches!(result, Err(CollabError::SnapshotNotFound(_))));
    assert_eq!(doc.get_current_data(), before);
    assert_eq!(doc.operation_count(), 1);
}

#[test]
fn snapshots_are_visible_to_peers() {
    let a = session("user-a", 1);
    let b = session("user-b", 2);
    a.add_node("n1", json!({})).unwrap();
    let snap = a.create_snapshot("shared").unwrap();
    sync_both(&a, &b);

    let seen = b.get_snapshots();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], snap);

    // Peer B can roll back using A's snapshot.
    b.add_node("n2", json!({})).unwrap();
    b.rollback_to_snapshot(&snap.id).unwrap();
    sync_both(&a, &b);
    assert_eq!(a.get_current_data(), snap.data);
    assert_eq!(b.get_current_data(), snap.data);
}
