//! Integration tests for cadstream_tree
//!
//! Exercises the registry through parsed documents: id arithmetic across
//! inclusions, index round-trips and deletion bookkeeping.

use cadstream_core::id::{AuthoredNodeId, InclusionKey, ModelKey, RuntimeNodeId};
use cadstream_tree::*;
use glam::Mat4;
use std::sync::Arc;

fn document(count: u32) -> ParsedAssembly {
    let mut nodes = vec![NodeInfo::new(0, None, NodeKind::ProductOccurrence, "top")];
    for i in 1..count {
        let mut body = NodeInfo::new(i, Some(0), NodeKind::Mesh, format!("body{}", i));
        body.instances = vec![i];
        nodes.push(body);
    }
    let mut parsed = ParsedAssembly {
        nodes,
        ..Default::default()
    };
    parsed.id_span = parsed.required_span();
    parsed
}

fn include(tree: &mut AssemblyTree, parsed: &Arc<ParsedAssembly>, key: u32) -> ContextId {
    let root = tree.root_id();
    let attach = tree.create_attach_context(Parent::Node(root), "model").unwrap();
    let inclusion = tree.create_inclusion_context(attach, parsed.id_span).unwrap();
    let context = tree.inclusion_context_mut(inclusion).unwrap();
    context.inclusion_key = Some(InclusionKey(key));
    context.model_key = Some(ModelKey(key));
    tree.reify(inclusion, Arc::clone(parsed)).unwrap();
    inclusion
}

#[test]
fn test_same_document_twice_gets_distinct_ids() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut tree = AssemblyTree::new();
    let parsed = Arc::new(document(5));

    let first = include(&mut tree, &parsed, 1);
    let second = include(&mut tree, &parsed, 2);
    let a = tree.inclusion_context(first).unwrap().offset;
    let b = tree.inclusion_context(second).unwrap().offset;

    for authored in 0..5 {
        let x = RuntimeNodeId::from_authored(AuthoredNodeId::new(authored), a).unwrap();
        let y = RuntimeNodeId::from_authored(AuthoredNodeId::new(authored), b).unwrap();
        assert_ne!(x, y);
        assert_eq!(x.to_authored(a), Some(AuthoredNodeId::new(authored)));
        assert_eq!(tree.lookup_any_tree_node(x).unwrap().id(), x);
        assert_eq!(tree.owning_inclusion(y), Some(second));
    }
    assert_eq!(tree.node_count(), 11);
}

#[test]
fn test_delete_inclusion_frees_offset_for_reuse() {
    let mut tree = AssemblyTree::new();
    let parsed = Arc::new(document(3));

    let first = include(&mut tree, &parsed, 1);
    let offset = tree.inclusion_context(first).unwrap().offset;
    let top = RuntimeNodeId::from_authored(AuthoredNodeId::new(0), offset).unwrap();

    let report = tree.discard_context(tree.owning_attach_context(Parent::Node(top)).unwrap()).unwrap();
    assert_eq!(report.inclusions, vec![InclusionKey(1)]);
    assert_eq!(report.nodes.len(), 3);
    assert!(report.instances.is_empty());

    let again = include(&mut tree, &parsed, 2);
    assert_eq!(tree.inclusion_context(again).unwrap().offset, offset);
    assert_eq!(tree.node_count(), 4);
}

#[test]
fn test_index_round_trips() {
    let mut tree = AssemblyTree::new();
    let root = tree.root_id();
    let a = tree
        .create_node(root, NodeKind::ProductOccurrence, "a", Mat4::IDENTITY, true)
        .unwrap();
    let b = tree
        .create_node(root, NodeKind::ProductOccurrence, "b", Mat4::IDENTITY, true)
        .unwrap();

    let layer = tree.register_layer("Walls");
    assert!(tree.register_node_in_layer(a, layer));
    assert!(tree.register_node_in_layer(b, layer));
    assert_eq!(tree.get_layer_of_node(a), Some(layer));
    let members = tree.get_nodes_from_layer(layer);
    assert_eq!(members.len(), 2);
    assert!(members.contains(&a) && members.contains(&b));

    let filter = tree.add_filter("walls", true, &[a]);
    assert_eq!(tree.get_filters_with_node(a), vec![filter]);
    assert_eq!(tree.get_nodes_from_filter(filter), vec![a]);

    assert!(tree.register_generic_type(b, "IfcDoor"));
    assert!(tree.register_generic_id(b, "door-7"));
    assert!(!tree.register_generic_id(a, "door-7"));
    assert_eq!(tree.lookup_by_generic_id("door-7"), Some(b));

    tree.delete_node(a).unwrap();
    assert_eq!(tree.get_nodes_from_layer(layer), vec![b]);
    assert!(tree.get_nodes_from_filter(filter).is_empty());

    tree.delete_node(b).unwrap();
    assert!(tree.get_nodes_by_generic_type("IfcDoor").is_empty());
    assert_eq!(tree.lookup_by_generic_id("door-7"), None);
    assert!(tree.indices().is_empty());
}

#[test]
fn test_branch_visibility_idempotent() {
    let mut tree = AssemblyTree::new();
    let parsed = Arc::new(document(4));
    let inclusion = include(&mut tree, &parsed, 1);
    let offset = tree.inclusion_context(inclusion).unwrap().offset;
    let id = |n| RuntimeNodeId::from_authored(AuthoredNodeId::new(n), offset).unwrap();
    let root = tree.root_id();

    let before = tree.branch_visibility(root);
    tree.set_node_visibility(id(2), false).unwrap();
    assert_eq!(tree.branch_visibility(root), Some(BranchVisibility::Mixed));
    assert_eq!(tree.branch_visibility(root), Some(BranchVisibility::Mixed));

    tree.set_node_visibility(id(2), true).unwrap();
    assert_eq!(tree.branch_visibility(root), before);

    for n in 1..4 {
        tree.set_node_visibility(id(n), false).unwrap();
    }
    assert_eq!(tree.branch_visibility(id(0)), Some(BranchVisibility::Hidden));
    assert_eq!(tree.effective_instance_visibility(id(0)).iter().filter(|(_, v)| *v).count(), 0);
}

#[test]
fn test_blocked_delete_keeps_everything() {
    let mut tree = AssemblyTree::new();
    let parsed = Arc::new(document(3));
    let inclusion = include(&mut tree, &parsed, 1);
    let offset = tree.inclusion_context(inclusion).unwrap().offset;
    let top = RuntimeNodeId::from_authored(AuthoredNodeId::new(0), offset).unwrap();
    let leaf = RuntimeNodeId::from_authored(AuthoredNodeId::new(2), offset).unwrap();

    tree.prevent_node_deletion(leaf).unwrap();
    let outcome = tree.delete_node(top).unwrap();
    assert_eq!(outcome, DeleteOutcome::Blocked { blocker: leaf });
    assert_eq!(tree.children(top).len(), 2);

    tree.allow_node_deletion(leaf);
    let DeleteOutcome::Deleted(report) = tree.delete_node(top).unwrap() else {
        panic!("deletion blocked");
    };
    assert_eq!(report.instances.len(), 2);
}

#[test]
fn test_deleting_prototype_root_refreshes_referrers() {
    let mut referrer = NodeInfo::new(0, None, NodeKind::ProductOccurrence, "referrer");
    referrer.prototype = Some(1);
    let mut hidden = NodeInfo::new(2, None, NodeKind::ProductOccurrence, "hidden");
    hidden.visible = false;
    let mut parsed = ParsedAssembly {
        nodes: vec![referrer],
        prototypes: vec![PrototypeInfo {
            id: 1,
            nodes: vec![NodeInfo::new(1, None, NodeKind::ProductOccurrence, "shown"), hidden],
        }],
        ..Default::default()
    };
    parsed.id_span = parsed.required_span();

    let mut tree = AssemblyTree::new();
    let inclusion = include(&mut tree, &Arc::new(parsed), 1);
    let offset = tree.inclusion_context(inclusion).unwrap().offset;
    let id = |n| RuntimeNodeId::from_authored(AuthoredNodeId::new(n), offset).unwrap();

    assert_eq!(tree.branch_visibility(id(0)), Some(BranchVisibility::Mixed));
    assert!(tree.delete_node(id(2)).unwrap().is_deleted());
    assert_eq!(tree.children(id(0)), vec![id(1)]);
    assert_eq!(tree.branch_visibility(id(0)), Some(BranchVisibility::Shown));
}
