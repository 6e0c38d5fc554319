//! Operation dependencies and dependency-aware ordering.
//!
//! Hard dependencies (`must_exist`) gate the standard apply path: a missing
//! parent means local state is inconsistent. Soft dependencies only shape
//! ordering and import-replay eligibility.

use crate::domain::DomainState;
use crate::error::SyncResult;
use oplog_model::{OpType, Operation};
use oplog_types::{EntityId, EntityKey, EntityType};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// How an operation relates to an entity it depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyRelation {
    /// The entity is a structural parent (parent task, owning project).
    Parent,
    /// The entity is referenced (tags, sub-tasks).
    Reference,
    /// The entity is the operation's own target.
    Target,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationDependency {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub must_exist: bool,
    pub relation: DependencyRelation,
}

impl OperationDependency {
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

/// Outcome of [`DependencyResolver::check_dependencies`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyCheck {
    pub missing: Vec<OperationDependency>,
}

impl DependencyCheck {
    /// Missing dependencies that must exist.
    pub fn missing_hard(&self) -> impl Iterator<Item = &OperationDependency> {
        self.missing.iter().filter(|d| d.must_exist)
    }

    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.missing_hard().next().is_none()
    }
}

fn field<'a>(payload: &'a Value, name: &str) -> Option<&'a Value> {
    payload
        .get(name)
        .or_else(|| payload.get("changes").and_then(|c| c.get(name)))
}

fn str_field(payload: &Value, name: &str) -> Option<EntityId> {
    field(payload, name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(EntityId::from)
}

fn str_list_field(payload: &Value, name: &str) -> Vec<EntityId> {
    field(payload, name)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(EntityId::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Checks operation dependencies against domain state.
#[derive(Clone)]
pub struct DependencyResolver {
    domain: Arc<dyn DomainState>,
}

impl DependencyResolver {
    pub fn new(domain: Arc<dyn DomainState>) -> Self {
        Self { domain }
    }

    /// Dependencies an operation has on other entities.
    ///
    /// - task `parentId`: hard parent
    /// - task or note `projectId` on create and move: hard parent
    /// - `tagIds`: soft references to tags
    /// - `subTaskIds`: soft references to tasks
    /// - non-create ops: soft reference to their own target
    ///
    /// A create never depends on its own target.
    #[must_use]
    pub fn extract_dependencies(op: &Operation) -> Vec<OperationDependency> {
        if op.is_full_state() {
            return Vec::new();
        }
        let payload = &op.payload;
        let mut deps = Vec::new();
        let mut push = |entity_type, entity_id, must_exist, relation| {
            deps.push(OperationDependency {
                entity_type,
                entity_id,
                must_exist,
                relation,
            });
        };

        if op.entity_type == EntityType::Task {
            if let Some(parent) = str_field(payload, "parentId") {
                push(EntityType::Task, parent, true, DependencyRelation::Parent);
            }
            for sub in str_list_field(payload, "subTaskIds") {
                push(EntityType::Task, sub, false, DependencyRelation::Reference);
            }
        }
        if matches!(op.entity_type, EntityType::Task | EntityType::Note)
            && matches!(op.op_type, OpType::Create | OpType::Move)
        {
            if let Some(project) = str_field(payload, "projectId") {
                push(EntityType::Project, project, true, DependencyRelation::Parent);
            }
        }
        for tag in str_list_field(payload, "tagIds") {
            push(EntityType::Tag, tag, false, DependencyRelation::Reference);
        }
        if !matches!(op.op_type, OpType::Create | OpType::Batch) {
            for id in op.target_ids() {
                push(op.entity_type, id, false, DependencyRelation::Target);
            }
        }

        let own: HashSet<EntityKey> = op.entity_keys().into_iter().collect();
        deps.retain(|d| d.relation == DependencyRelation::Target || !own.contains(&d.key()));
        if op.op_type == OpType::Create {
            deps.retain(|d| d.relation != DependencyRelation::Target);
        }
        deps
    }

    /// Reports which dependencies do not exist in domain state.
    pub async fn check_dependencies(
        &self,
        deps: &[OperationDependency],
    ) -> SyncResult<DependencyCheck> {
        let mut missing = Vec::new();
        for dep in deps {
            if !self.domain.entity_exists(&dep.key()).await? {
                missing.push(dep.clone());
            }
        }
        Ok(DependencyCheck { missing })
    }
}

/// Logs operations that depend on entities whose operations were dropped
/// during schema migration.
pub fn warn_about_dropped_dependencies(ops: &[Operation], dropped: &HashSet<EntityId>) -> usize {
    if dropped.is_empty() {
        return 0;
    }
    let mut affected = 0;
    for op in ops {
        let hits: Vec<_> = DependencyResolver::extract_dependencies(op)
            .into_iter()
            .filter(|d| d.relation != DependencyRelation::Target && dropped.contains(&d.entity_id))
            .collect();
        if !hits.is_empty() {
            affected += 1;
            warn!(
                "operation {} depends on entities dropped by migration: {:?}",
                op.id,
                hits.iter().map(|d| d.entity_id.as_str()).collect::<Vec<_>>()
            );
        }
    }
    affected
}

/// Orders operations so dependencies apply first.
///
/// - a create of an entity precedes ops that hard-depend on it
/// - a delete follows every op that references the deleted entity
/// - ops on the same entity keep their input order
///
/// Among ready ops, creates go first, then ops other ops softly depend on,
/// then earlier timestamps, then input order. Ops caught in a cycle are
/// appended in input order.
#[must_use]
pub fn sort_by_dependency(ops: Vec<Operation>) -> Vec<Operation> {
    let n = ops.len();
    if n < 2 {
        return ops;
    }

    let deps: Vec<Vec<OperationDependency>> =
        ops.iter().map(DependencyResolver::extract_dependencies).collect();
    let keys: Vec<Vec<EntityKey>> = ops.iter().map(Operation::entity_keys).collect();

    let mut creators: HashMap<EntityKey, Vec<usize>> = HashMap::new();
    let mut deleters: HashMap<EntityKey, Vec<usize>> = HashMap::new();
    let mut soft_targets: HashSet<EntityKey> = HashSet::new();
    for (i, op) in ops.iter().enumerate() {
        for key in &keys[i] {
            match op.op_type {
                OpType::Create => creators.entry(key.clone()).or_default().push(i),
                OpType::Delete => deleters.entry(key.clone()).or_default().push(i),
                _ => {}
            }
        }
        for dep in deps[i].iter().filter(|d| d.relation == DependencyRelation::Reference) {
            soft_targets.insert(dep.key());
        }
    }

    let mut edges: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    let add_edge = |from: usize, to: usize, edges: &mut Vec<HashSet<usize>>| {
        if from != to {
            edges[from].insert(to);
        }
    };

    let mut last_on_entity: HashMap<&EntityKey, usize> = HashMap::new();
    for (i, op_keys) in keys.iter().enumerate() {
        for key in op_keys {
            if let Some(prev) = last_on_entity.insert(key, i) {
                add_edge(prev, i, &mut edges);
            }
        }
    }

    for (i, op_deps) in deps.iter().enumerate() {
        let own: HashSet<&EntityKey> = keys[i].iter().collect();
        for dep in op_deps {
            let key = dep.key();
            if own.contains(&key) {
                continue;
            }
            if dep.must_exist {
                for &c in creators.get(&key).into_iter().flatten() {
                    add_edge(c, i, &mut edges);
                }
            }
            for &d in deleters.get(&key).into_iter().flatten() {
                add_edge(i, d, &mut edges);
            }
        }
    }

    let mut indegree = vec![0usize; n];
    for targets in &edges {
        for &t in targets {
            indegree[t] += 1;
        }
    }

    let priority = |i: usize| {
        let op = &ops[i];
        let not_create = u8::from(op.op_type != OpType::Create && !op.is_full_state());
        let no_soft_dependents = u8::from(!keys[i].iter().any(|k| soft_targets.contains(k)));
        Reverse((not_create, no_soft_dependents, op.timestamp, i))
    };

    let mut ready: BinaryHeap<_> = (0..n).filter(|&i| indegree[i] == 0).map(priority).collect();
    let mut order = Vec::with_capacity(n);
    let mut placed = vec![false; n];
    while let Some(Reverse((_, _, _, i))) = ready.pop() {
        order.push(i);
        placed[i] = true;
        for &t in &edges[i] {
            indegree[t] -= 1;
            if indegree[t] == 0 {
                ready.push(priority(t));
            }
        }
    }

    if order.len() < n {
        warn!("dependency cycle among {} operations, keeping input order for them", n - order.len());
        order.extend((0..n).filter(|&i| !placed[i]));
    }

    let mut slots: Vec<Option<Operation>> = ops.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}
