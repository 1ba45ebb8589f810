//! Root wiring and ranks.
//!
//! After cycles are gone every operation without incoming relations hangs
//! off the graph root, and all operations get their position in a
//! deterministic execution order.

use crate::graph::{Graph, OperationId, RelationKind};

use super::reduce::topological_order;

/// Relate the root to every otherwise unconstrained operation.
pub fn connect_root(graph: &mut Graph) -> usize {
    graph.relations_mut().remove_kind(RelationKind::Root);

    let root = graph.root();
    let orphans: Vec<OperationId> = graph
        .operation_ids()
        .filter(|op| *op != root && graph.relations().incoming(*op).is_empty())
        .collect();
    for op in &orphans {
        graph.add_relation(root, *op, RelationKind::Root, "Root", None);
    }
    orphans.len()
}

/// Store each operation's position in the execution order.
///
/// Operations left on a cycle get no rank.
pub fn assign_ranks(graph: &mut Graph) {
    let order = topological_order(graph).unwrap_or_default();
    let ids: Vec<OperationId> = graph.operation_ids().collect();
    for op in ids {
        if let Some(node) = graph.operation_mut(op) {
            node.rank = None;
        }
    }
    for (rank, op) in order.into_iter().enumerate() {
        if let Some(node) = graph.operation_mut(op) {
            node.rank = Some(rank as u32);
        }
    }
}
