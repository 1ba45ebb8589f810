//! Transitive Reduction
//!
//! A relation `A -> C` is redundant when `C` has another direct dependency
//! `B` that already depends on `A`: the path `A -> ... -> B -> C` enforces the
//! same ordering. Operations are visited in topological order and each keeps
//! a bitset of everything it transitively depends on. A bitset lives only
//! until the last successor of its operation has been visited, so memory
//! follows the width of the graph rather than its size.
//!
//! In a DAG every relation with an alternative path can be taken out at the
//! same time without changing reachability. Copy-sync relations are never
//! removed; the write-back they order is part of the evaluation result.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::graph::{Graph, OperationId, RelationId, RelationKind, RelationStatus};

/// Fixed-size bitset over operation handles.
#[derive(Clone)]
struct OpSet {
    words: Vec<u64>,
}

impl OpSet {
    fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
        }
    }

    fn insert(&mut self, op: OperationId) {
        self.words[op.index() / 64] |= 1 << (op.index() % 64);
    }

    fn contains(&self, op: OperationId) -> bool {
        self.words[op.index() / 64] & (1 << (op.index() % 64)) != 0
    }

    fn union_with(&mut self, other: &OpSet) {
        for (word, bits) in self.words.iter_mut().zip(&other.words) {
            *word |= bits;
        }
    }
}

/// Topological order of live operations; lowest handle first among ready ones.
///
/// Returns `None` if the active relations still contain a cycle.
pub(crate) fn topological_order(graph: &Graph) -> Option<Vec<OperationId>> {
    let mut in_degree = vec![0usize; graph.operation_capacity()];
    for relation in graph.relations().active() {
        in_degree[relation.to().index()] += 1;
    }

    let mut ready: BTreeSet<OperationId> = graph
        .operation_ids()
        .filter(|op| in_degree[op.index()] == 0)
        .collect();
    let mut order = Vec::with_capacity(graph.operation_capacity());

    while let Some(op) = ready.pop_first() {
        order.push(op);
        for succ in graph.relations().successors(op) {
            in_degree[succ.index()] -= 1;
            if in_degree[succ.index()] == 0 {
                ready.insert(succ);
            }
        }
    }

    (order.len() == graph.operation_ids().count()).then_some(order)
}

/// Relations that can go without changing reachability.
struct Reduction {
    redundant: Vec<RelationId>,
    /// Most ancestor sets alive at the same time.
    peak_sets: usize,
}

fn redundant_relations(graph: &Graph, order: &[OperationId]) -> Reduction {
    let capacity = graph.operation_capacity();
    let mut ancestors: Vec<Option<OpSet>> = vec![None; capacity];
    let mut consumers: Vec<usize> = vec![0; capacity];
    for op in order {
        consumers[op.index()] = graph.relations().outgoing(*op).len();
    }
    let mut live = 0usize;
    let mut reduction = Reduction {
        redundant: Vec::new(),
        peak_sets: 0,
    };

    for op in order {
        let incoming = graph.relations().incoming(*op);

        // Everything reachable through some direct dependency.
        let mut covered: Option<OpSet> = None;
        for relation in incoming.iter().filter_map(|id| graph.relations().get(*id)) {
            let Some(set) = &ancestors[relation.from().index()] else {
                continue;
            };
            match &mut covered {
                Some(covered) => covered.union_with(set),
                None => covered = Some(set.clone()),
            }
        }
        let is_covered = |from: OperationId| covered.as_ref().is_some_and(|set| set.contains(from));

        // Keep one relation per source. Prefer copy-sync, then the oldest.
        let mut kept: HashMap<OperationId, RelationId> = HashMap::new();
        for relation in incoming.iter().filter_map(|id| graph.relations().get(*id)) {
            let from = relation.from();
            if relation.kind() == RelationKind::CowSync {
                continue;
            }
            if is_covered(from) {
                reduction.redundant.push(relation.id());
                continue;
            }
            let has_sync = incoming
                .iter()
                .filter_map(|id| graph.relations().get(*id))
                .any(|other| other.from() == from && other.kind() == RelationKind::CowSync);
            if has_sync || kept.contains_key(&from) {
                reduction.redundant.push(relation.id());
            } else {
                kept.insert(from, relation.id());
            }
        }

        // Predecessors whose successors are all visited no longer need a set.
        for from in graph.relations().predecessors(*op) {
            let remaining = &mut consumers[from.index()];
            *remaining -= 1;
            if *remaining == 0 && ancestors[from.index()].take().is_some() {
                live -= 1;
            }
        }

        if consumers[op.index()] > 0 && !incoming.is_empty() {
            let mut own = covered.unwrap_or_else(|| OpSet::new(capacity));
            for from in graph.relations().predecessors(*op) {
                own.insert(from);
            }
            ancestors[op.index()] = Some(own);
            live += 1;
            reduction.peak_sets = reduction.peak_sets.max(live);
        }
    }

    reduction
}

/// Take redundant relations out of traversal. Returns how many.
///
/// The graph must be acyclic; a cyclic graph is left untouched.
pub fn reduce(graph: &mut Graph) -> usize {
    let Some(order) = topological_order(graph) else {
        debug!("graph still cyclic, transitive reduction skipped");
        return 0;
    };
    let reduction = redundant_relations(graph, &order);
    let removed = reduction
        .redundant
        .iter()
        .filter(|id| {
            graph
                .relations_mut()
                .deactivate(**id, RelationStatus::Reduced)
                .is_some()
        })
        .count();
    debug!(removed, peak_sets = reduction.peak_sets, "transitive reduction complete");
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ComponentKind, OperationCode};
    use crate::scene::{EntityId, EntityKind};

    fn ops(count: usize) -> (Graph, Vec<OperationId>) {
        let mut graph = Graph::new();
        let id_node = graph.add_id_node(EntityId::new(0), "Cube", EntityKind::Object);
        let comp = graph
            .add_component(id_node, ComponentKind::Geometry)
            .expect("id node exists");
        let ops = (0..count)
            .filter_map(|i| graph.add_operation(comp, OperationCode::Modifier(format!("m{i}")), None))
            .collect();
        (graph, ops)
    }

    #[test]
    fn shortcut_is_removed() {
        let (mut graph, ops) = ops(3);
        let (a, b, c) = (ops[0], ops[1], ops[2]);
        graph.add_relation(a, b, RelationKind::Data, "ab", None);
        graph.add_relation(b, c, RelationKind::Data, "bc", None);
        graph.add_relation(a, c, RelationKind::Data, "ac", None);

        assert_eq!(reduce(&mut graph), 1);
        assert!(!graph.relations().has_relation(a, c));
        assert!(graph.reaches(a, c));
        assert_eq!(graph.stats().reduced_relations, 1);
    }

    #[test]
    fn only_path_is_kept() {
        let (mut graph, ops) = ops(3);
        graph.add_relation(ops[0], ops[1], RelationKind::Data, "ab", None);
        graph.add_relation(ops[0], ops[2], RelationKind::Data, "ac", None);

        assert_eq!(reduce(&mut graph), 0);
        assert!(graph.reaches(ops[0], ops[2]));
    }

    #[test]
    fn duplicates_collapse() {
        let (mut graph, ops) = ops(2);
        graph.add_relation(ops[0], ops[1], RelationKind::Data, "first", None);
        graph.add_relation(ops[0], ops[1], RelationKind::Operation, "second", None);

        assert_eq!(reduce(&mut graph), 1);
        let kept: Vec<_> = graph.relations().active().map(|r| r.name().to_string()).collect();
        assert_eq!(kept, vec!["first"]);
    }

    #[test]
    fn cow_sync_survives() {
        let (mut graph, ops) = ops(3);
        let (a, b, c) = (ops[0], ops[1], ops[2]);
        graph.add_relation(a, b, RelationKind::Data, "ab", None);
        graph.add_relation(b, c, RelationKind::Data, "bc", None);
        graph.add_relation(a, c, RelationKind::CowSync, "sync", None);

        assert_eq!(reduce(&mut graph), 0);
        assert!(graph.relations().has_relation(a, c));
    }

    #[test]
    fn ancestor_sets_are_released() {
        let (mut graph, ops) = ops(600);
        for chain in ops.chunks(3) {
            graph.add_relation(chain[0], chain[1], RelationKind::Data, "first", None);
            graph.add_relation(chain[1], chain[2], RelationKind::Data, "second", None);
        }

        let order = topological_order(&graph).expect("acyclic");
        let reduction = redundant_relations(&graph, &order);
        assert!(reduction.redundant.is_empty());
        assert_eq!(reduction.peak_sets, 1);
    }

    #[test]
    fn cyclic_graph_is_skipped() {
        let (mut graph, ops) = ops(2);
        graph.add_relation(ops[0], ops[1], RelationKind::Data, "ab", None);
        graph.add_relation(ops[1], ops[0], RelationKind::Data, "ba", None);
        assert!(topological_order(&graph).is_none());
        assert_eq!(reduce(&mut graph), 0);
    }
}
