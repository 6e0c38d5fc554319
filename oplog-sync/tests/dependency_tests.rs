mod common;

use common::{clock, task_op};
use oplog_model::{OpType, Operation};
use oplog_sync::dependency::{
    sort_by_dependency, warn_about_dropped_dependencies, DependencyRelation, DependencyResolver,
};
use oplog_types::{ClientId, EntityId, EntityType};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;

fn ids(ops: &[Operation]) -> Vec<String> {
    ops.iter().map(|op| op.entity_id.as_ref().map(|e| e.to_string()).unwrap_or_default()).collect()
}

// ── Extraction ───────────────────────────────────────────────────

#[test]
fn task_parent_and_project_are_hard() {
    let op = task_op(
        "a",
        OpType::Create,
        "t1",
        json!({"parentId": "p", "projectId": "proj", "tagIds": ["x"], "subTaskIds": ["s"]}),
        &[("a", 1)],
    );
    let deps = DependencyResolver::extract_dependencies(&op);

    let hard: Vec<_> = deps.iter().filter(|d| d.must_exist).map(|d| (d.entity_type, d.entity_id.as_str())).collect();
    assert_eq!(hard, vec![(EntityType::Task, "p"), (EntityType::Project, "proj")]);
    let soft: Vec<_> = deps.iter().filter(|d| !d.must_exist).map(|d| (d.entity_type, d.entity_id.as_str())).collect();
    assert_eq!(soft, vec![(EntityType::Task, "s"), (EntityType::Tag, "x")]);
}

#[test]
fn project_is_only_hard_on_create_and_move() {
    let update = task_op("a", OpType::Update, "t1", json!({"changes": {"projectId": "proj"}}), &[("a", 1)]);
    let deps = DependencyResolver::extract_dependencies(&update);
    assert!(deps.iter().all(|d| !d.must_exist));

    let mv = task_op("a", OpType::Move, "t1", json!({"changes": {"projectId": "proj"}}), &[("a", 1)]);
    let deps = DependencyResolver::extract_dependencies(&mv);
    assert!(deps.iter().any(|d| d.must_exist && d.entity_type == EntityType::Project));
}

#[test]
fn non_create_depends_softly_on_its_target() {
    let update = task_op("a", OpType::Update, "t1", json!({}), &[("a", 1)]);
    let deps = DependencyResolver::extract_dependencies(&update);
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].relation, DependencyRelation::Target);
    assert!(!deps[0].must_exist);

    let create = task_op("a", OpType::Create, "t1", json!({}), &[("a", 1)]);
    assert!(DependencyResolver::extract_dependencies(&create).is_empty());
}

#[test]
fn full_state_ops_have_no_dependencies() {
    let import = Operation::full_state(ClientId::from("a"), OpType::SyncImport, json!({}), clock(&[("a", 1)]));
    assert!(DependencyResolver::extract_dependencies(&import).is_empty());
}

#[test]
fn dropped_dependencies_are_counted() {
    let child = task_op("a", OpType::Create, "c", json!({"parentId": "gone"}), &[("a", 1)]);
    let unrelated = task_op("a", OpType::Create, "u", json!({}), &[("a", 2)]);
    let dropped: HashSet<EntityId> = [EntityId::from("gone")].into_iter().collect();
    assert_eq!(warn_about_dropped_dependencies(&[child, unrelated], &dropped), 1);
}

// ── Ordering ─────────────────────────────────────────────────────

#[test]
fn delete_follows_ops_referencing_the_entity() {
    let delete_tag = Operation::new(ClientId::from("a"), OpType::Delete, EntityType::Tag, "x", json!(null), clock(&[("a", 1)]))
        .with_timestamp(1);
    let tagged = task_op("a", OpType::Update, "t1", json!({"tagIds": ["x"]}), &[("a", 2)]).with_timestamp(2);

    let sorted = sort_by_dependency(vec![delete_tag.clone(), tagged.clone()]);
    assert_eq!(sorted.iter().map(|op| op.id).collect::<Vec<_>>(), vec![tagged.id, delete_tag.id]);
}

#[test]
fn creates_go_first_among_ready_ops() {
    let update = task_op("a", OpType::Update, "t1", json!({}), &[("a", 1)]).with_timestamp(1);
    let create = task_op("a", OpType::Create, "t2", json!({}), &[("a", 2)]).with_timestamp(5);
    let sorted = sort_by_dependency(vec![update, create]);
    assert_eq!(ids(&sorted), vec!["t2", "t1"]);
}

#[test]
fn chain_of_parents_is_ordered() {
    let c = task_op("a", OpType::Create, "c", json!({"parentId": "b"}), &[("a", 3)]).with_timestamp(1);
    let b = task_op("a", OpType::Create, "b", json!({"parentId": "a"}), &[("a", 2)]).with_timestamp(2);
    let a = task_op("a", OpType::Create, "a", json!({}), &[("a", 1)]).with_timestamp(3);
    assert_eq!(ids(&sort_by_dependency(vec![c, b, a])), vec!["a", "b", "c"]);
}

#[test]
fn cycles_fall_back_to_input_order() {
    let x = task_op("a", OpType::Create, "x", json!({"parentId": "y"}), &[("a", 1)]);
    let y = task_op("a", OpType::Create, "y", json!({"parentId": "x"}), &[("a", 2)]);
    let free = task_op("a", OpType::Create, "z", json!({}), &[("a", 3)]);
    assert_eq!(ids(&sort_by_dependency(vec![x, y, free])), vec!["z", "x", "y"]);
}

fn arb_op() -> impl Strategy<Value = Operation> {
    let op_type = prop_oneof![Just(OpType::Create), Just(OpType::Update), Just(OpType::Delete)];
    (op_type, 0..5u8, proptest::option::of(0..5u8), 0..1000i64).prop_map(|(op_type, id, parent, ts)| {
        let payload = match parent {
            Some(p) => json!({ "parentId": format!("t{p}") }),
            None => json!({}),
        };
        task_op("a", op_type, &format!("t{id}"), payload, &[("a", 1)]).with_timestamp(ts)
    })
}

proptest! {
    #[test]
    fn sort_is_a_permutation(ops in proptest::collection::vec(arb_op(), 0..20)) {
        let sorted = sort_by_dependency(ops.clone());
        let mut before: Vec<_> = ops.iter().map(|op| op.id).collect();
        let mut after: Vec<_> = sorted.iter().map(|op| op.id).collect();
        before.sort();
        after.sort();
        prop_assert_eq!(before, after);
    }

    #[test]
    fn sort_keeps_per_entity_order(ops in proptest::collection::vec(arb_op(), 0..20)) {
        let sorted = sort_by_dependency(ops.clone());
        for id in 0..5u8 {
            let target = format!("t{id}");
            let original: Vec<_> = ops.iter().filter(|op| ids(std::slice::from_ref(op))[0] == target).map(|op| op.id).collect();
            let result: Vec<_> = sorted.iter().filter(|op| ids(std::slice::from_ref(op))[0] == target).map(|op| op.id).collect();
            prop_assert_eq!(original, result);
        }
    }
}
