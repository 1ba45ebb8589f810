//! Cycle Resolution
//!
//! Drivers and constraints can reference arbitrary entities, so the builder
//! may produce cycles. They are broken structurally here, before anything
//! that assumes a DAG runs.
//!
//! The resolver does an iterative depth-first traversal with the usual three
//! colors. Traversal starts at every operation without incoming relations, in
//! handle order, then at whatever is left unvisited (operations that only
//! live on cycles). Every relation into an operation that is still on the
//! stack closes a cycle and is taken out of traversal. Removing the back
//! edges of a depth-first forest leaves an acyclic graph.
//!
//! Which relation of a cycle gets dropped depends on traversal order. It is
//! always the one discovered last, i.e. the one closing the cycle.

use tracing::{debug, warn};

use crate::error::Diagnostic;
use crate::graph::{Graph, OperationId, RelationId, RelationStatus};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

struct Frame {
    op: OperationId,
    outgoing: Vec<RelationId>,
    next: usize,
}

impl Frame {
    fn new(graph: &Graph, op: OperationId) -> Self {
        Self {
            op,
            outgoing: graph.relations().outgoing(op).to_vec(),
            next: 0,
        }
    }
}

/// Relations closing a cycle, in discovery order.
fn find_back_edges(graph: &Graph) -> Vec<RelationId> {
    let mut color = vec![Color::White; graph.operation_capacity()];
    let mut back_edges = Vec::new();

    let sources = graph
        .operation_ids()
        .filter(|op| graph.relations().incoming(*op).is_empty());
    let starts: Vec<OperationId> = sources.chain(graph.operation_ids()).collect();

    for start in starts {
        if color[start.index()] != Color::White {
            continue;
        }
        color[start.index()] = Color::Gray;
        let mut stack = vec![Frame::new(graph, start)];

        while let Some(frame) = stack.last_mut() {
            let Some(relation_id) = frame.outgoing.get(frame.next).copied() else {
                color[frame.op.index()] = Color::Black;
                stack.pop();
                continue;
            };
            frame.next += 1;

            let Some(relation) = graph.relations().get(relation_id) else {
                continue;
            };
            let to = relation.to();
            match color[to.index()] {
                Color::White => {
                    color[to.index()] = Color::Gray;
                    stack.push(Frame::new(graph, to));
                }
                Color::Gray => back_edges.push(relation_id),
                Color::Black => {}
            }
        }
    }

    back_edges
}

/// Make the active relation set acyclic.
///
/// Data and copy-sync relations that had to go are reported as
/// [`Diagnostic::CycleBroken`]; advisory ones are dropped silently. Returns
/// the number of relations taken out.
pub fn resolve_cycles(graph: &mut Graph, diagnostics: &mut Vec<Diagnostic>) -> usize {
    let back_edges = find_back_edges(graph);

    for relation_id in &back_edges {
        let Some(relation) = graph
            .relations_mut()
            .deactivate(*relation_id, RelationStatus::Cyclic)
        else {
            continue;
        };
        let (from, to, kind) = (relation.from(), relation.to(), relation.kind());
        let name = relation.name().to_string();

        if kind.is_advisory() {
            debug!(
                from = %graph.describe(from),
                to = %graph.describe(to),
                %kind,
                "advisory relation dropped to break a cycle"
            );
            continue;
        }

        let diagnostic = Diagnostic::CycleBroken {
            from: graph.describe(from),
            to: graph.describe(to),
            kind,
            name,
        };
        warn!("{diagnostic}");
        diagnostics.push(diagnostic);
    }

    back_edges.len()
}

/// Whether the active relations form a DAG.
pub fn is_acyclic(graph: &Graph) -> bool {
    find_back_edges(graph).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ComponentKind, OperationCode, RelationKind};
    use crate::scene::{EntityId, EntityKind};

    fn ring(len: usize, closing: RelationKind) -> (Graph, Vec<OperationId>) {
        let mut graph = Graph::new();
        let id_node = graph.add_id_node(EntityId::new(0), "Ring", EntityKind::Object);
        let comp = graph
            .add_component(id_node, ComponentKind::Parameters)
            .expect("id node exists");
        let ops: Vec<OperationId> = (0..len)
            .filter_map(|i| graph.add_operation(comp, OperationCode::Driver(format!("p{i}")), None))
            .collect();
        for pair in ops.windows(2) {
            graph.add_relation(pair[0], pair[1], RelationKind::Data, "next", None);
        }
        graph.add_relation(ops[len - 1], ops[0], closing, "closing", None);
        (graph, ops)
    }

    #[test]
    fn dag_is_untouched() {
        let mut graph = Graph::new();
        let root = graph.root();
        let time = graph.time_source();
        graph.add_relation(root, time, RelationKind::Root, "root", None);

        let mut diagnostics = Vec::new();
        assert_eq!(resolve_cycles(&mut graph, &mut diagnostics), 0);
        assert!(diagnostics.is_empty());
        assert!(is_acyclic(&graph));
    }

    #[test]
    fn data_cycle_removes_one_relation_with_warning() {
        let (mut graph, ops) = ring(3, RelationKind::Data);
        assert!(!is_acyclic(&graph));

        let mut diagnostics = Vec::new();
        assert_eq!(resolve_cycles(&mut graph, &mut diagnostics), 1);
        assert!(is_acyclic(&graph));
        assert!(!graph.relations().has_relation(ops[2], ops[0]));
        assert!(matches!(
            diagnostics.as_slice(),
            [Diagnostic::CycleBroken { kind: RelationKind::Data, .. }]
        ));
        assert_eq!(graph.stats().cyclic_relations, 1);
    }

    #[test]
    fn advisory_cycle_is_silent() {
        let (mut graph, _) = ring(2, RelationKind::Operation);
        let mut diagnostics = Vec::new();
        // Every operation is on the cycle, so traversal starts at the first
        // one and the relation closing back to it goes.
        assert_eq!(resolve_cycles(&mut graph, &mut diagnostics), 1);
        assert!(diagnostics.is_empty());
        assert!(is_acyclic(&graph));
    }

    #[test]
    fn self_loop_is_broken() {
        let (mut graph, ops) = ring(1, RelationKind::Data);
        let mut diagnostics = Vec::new();
        assert_eq!(resolve_cycles(&mut graph, &mut diagnostics), 1);
        assert!(!graph.relations().has_relation(ops[0], ops[0]));
    }
}
