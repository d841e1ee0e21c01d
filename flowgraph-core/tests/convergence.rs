//! Replicas that exchange every update converge, whatever the delivery order.

use std::sync::{Arc, Mutex};

use flowgraph_core::{DocumentOptions, EventBus, PipelineDocument, UpdateOrigin};
use proptest::prelude::*;
use serde_json::json;

const REPLICAS: usize = 3;

#[derive(Debug, Clone)]
enum Edit {
    AddNode(u8, u8),
    UpdateNode(u8, u8),
    DeleteNode(u8),
    AddEdge(u8, u8, u8),
    UpdateEdge(u8, u8),
    DeleteEdge(u8),
}

fn arb_edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (0u8..6, any::<u8>()).prop_map(|(id, v)| Edit::AddNode(id, v)),
        2 => (0u8..6, any::<u8>()).prop_map(|(id, v)| Edit::UpdateNode(id, v)),
        1 => (0u8..6).prop_map(Edit::DeleteNode),
        2 => (0u8..4, 0u8..6, 0u8..6).prop_map(|(id, s, t)| Edit::AddEdge(id, s, t)),
        1 => (0u8..4, any::<u8>()).prop_map(|(id, v)| Edit::UpdateEdge(id, v)),
        1 => (0u8..4).prop_map(Edit::DeleteEdge),
    ]
}

struct Replica {
    doc: PipelineDocument,
    outbox: Arc<Mutex<Vec<Vec<u8>>>>,
}

fn replica(index: usize) -> Replica {
    let doc = PipelineDocument::new(
        "pipeline",
        format!("user-{index}"),
        Arc::new(EventBus::new()),
        DocumentOptions {
            auto_snapshot_threshold: 0,
            client_id: Some(index as u64 + 1),
        },
    );
    let outbox = Arc::new(Mutex::new(Vec::new()));
    let sink = outbox.clone();
    doc.on_update(move |update, origin| {
        if origin == UpdateOrigin::Local {
            sink.lock().unwrap().push(update.to_vec());
        }
    });
    Replica { doc, outbox }
}

fn apply(doc: &PipelineDocument, edit: &Edit) {
    match *edit {
        Edit::AddNode(id, v) => {
            doc.add_node(&format!("n{id}"), json!({ "label": format!("v{v}") }))
                .unwrap();
        }
        Edit::UpdateNode(id, v) => {
            doc.update_node(&format!("n{id}"), json!({ "x": v })).unwrap();
        }
        Edit::DeleteNode(id) => {
            doc.delete_node(&format!("n{id}")).unwrap();
        }
        Edit::AddEdge(id, s, t) => {
            doc.add_edge(
                &format!("e{id}"),
                json!({ "source": format!("n{s}"), "target": format!("n{t}") }),
            )
            .unwrap();
        }
        Edit::UpdateEdge(id, v) => {
            doc.update_edge(&format!("e{id}"), json!({ "weight": v }))
                .unwrap();
        }
        Edit::DeleteEdge(id) => {
            doc.delete_edge(&format!("e{id}")).unwrap();
        }
    }
}

fn arb_scenario() -> impl Strategy<Value = (Vec<Vec<Edit>>, Vec<usize>)> {
    prop::collection::vec(prop::collection::vec(arb_edit(), 0..12), REPLICAS).prop_flat_map(
        |edits| {
            let total: usize = edits.iter().map(Vec::len).sum();
            let order = Just((0..total).collect::<Vec<_>>()).prop_shuffle();
            (Just(edits), order)
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn replicas_converge_under_any_delivery_order((edits, order) in arb_scenario()) {
        let replicas: Vec<Replica> = (0..REPLICAS).map(replica).collect();
        for (r, script) in replicas.iter().zip(&edits) {
            for edit in script {
                apply(&r.doc, edit);
            }
        }

        // Tag every produced update with its author and deliver the whole
        // pool to every replica in one shuffled order.
        let pool: Vec<(usize, Vec<u8>)> = replicas
            .iter()
            .enumerate()
            .flat_map(|(i, r)| {
                let updates = r.outbox.lock().unwrap().clone();
                updates.into_iter().map(move |u| (i, u))
            })
            .collect();
        prop_assume!(pool.len() <= order.len());

        for (i, target) in replicas.iter().enumerate() {
            for &slot in order.iter().filter(|&&slot| slot < pool.len()) {
                let (author, update) = &pool[slot];
                if *author != i {
                    target.doc.apply_update(update, UpdateOrigin::Remote).unwrap();
                }
            }
        }

        let reference = replicas[0].doc.get_current_data();
        for r in &replicas[1..] {
            prop_assert_eq!(&r.doc.get_current_data(), &reference);
            prop_assert_eq!(r.doc.operation_count(), replicas[0].doc.operation_count());
        }
    }

    #[test]
    fn merge_is_commutative(a in prop::collection::vec(arb_edit(), 1..10),
                            b in prop::collection::vec(arb_edit(), 1..10)) {
        let left = replica(0);
        let right = replica(1);
        for edit in &a { apply(&left.doc, edit); }
        for edit in &b { apply(&right.doc, edit); }
        let ua = left.doc.encode_state();
        let ub = right.doc.encode_state();

        let ab = replica(2);
        ab.doc.apply_update(&ua, UpdateOrigin::Remote).unwrap();
        ab.doc.apply_update(&ub, UpdateOrigin::Remote).unwrap();

        let ba = replica(3);
        ba.doc.apply_update(&ub, UpdateOrigin::Remote).unwrap();
        ba.doc.apply_update(&ua, UpdateOrigin::Remote).unwrap();

        prop_assert_eq!(ab.doc.get_current_data(), ba.doc.get_current_data());
        prop_assert_eq!(ab.doc.operations(), ba.doc.operations());
    }

    #[test]
    fn merge_is_idempotent(a in prop::collection::vec(arb_edit(), 1..10)) {
        let source = replica(0);
        for edit in &a { apply(&source.doc, edit); }
        let state = source.doc.encode_state();

        let target = replica(1);
        target.doc.apply_update(&state, UpdateOrigin::Remote).unwrap();
        let once = target.doc.get_current_data();
        let ops = target.doc.operation_count();
        target.doc.apply_update(&state, UpdateOrigin::Remote).unwrap();

        prop_assert_eq!(target.doc.get_current_data(), once);
        prop_assert_eq!(target.doc.operation_count(), ops);
    }
}

#[test]
fn concurrent_edits_to_different_nodes_both_survive() {
    let a = replica(0);
    let b = replica(1);
    a.doc.add_node("left", json!({ "label": "L" })).unwrap();
    b.doc.add_node("right", json!({ "label": "R" })).unwrap();

    let sa = a.doc.encode_state();
    let sb = b.doc.encode_state();
    a.doc.apply_update(&sb, UpdateOrigin::Remote).unwrap();
    b.doc.apply_update(&sa, UpdateOrigin::Remote).unwrap();

    let data = a.doc.get_current_data();
    assert_eq!(data.nodes.len(), 2);
    assert_eq!(data, b.doc.get_current_data());
    assert_eq!(a.doc.operation_count(), 2);
}

#[test]
fn concurrent_writes_to_same_node_pick_one_winner() {
    let a = replica(0);
    let b = replica(1);
    a.doc.add_node("n1", json!({ "label": "base" })).unwrap();
    b.doc
        .apply_update(&a.doc.encode_state(), UpdateOrigin::Remote)
        .unwrap();

    a.doc.update_node("n1", json!({ "label": "from-a" })).unwrap();
    b.doc.update_node("n1", json!({ "label": "from-b" })).unwrap();

    let sa = a.doc.encode_diff(&b.doc.state_vector()).unwrap();
    let sb = b.doc.encode_diff(&a.doc.state_vector()).unwrap();
    a.doc.apply_update(&sb, UpdateOrigin::Remote).unwrap();
    b.doc.apply_update(&sa, UpdateOrigin::Remote).unwrap();

    let winner = a.doc.get_node("n1").unwrap();
    assert_eq!(Some(winner.clone()), b.doc.get_node("n1"));
    let label = winner.field_str("label").unwrap();
    assert!(label == "from-a" || label == "from-b");
    // Both intents are kept in the audit log.
    assert_eq!(a.doc.operation_count(), 3);
}
