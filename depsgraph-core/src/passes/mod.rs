//! Graph Passes
//!
//! Whole-graph transformations run after relations are built:
//!
//! 1. [`resolve_cycles`] makes the relation set acyclic
//! 2. [`reduce`] drops relations implied by longer paths (optional)
//! 3. [`connect_root`] and [`assign_ranks`] prepare the graph for scheduling
//!
//! Passes never delete relations. They only take them out of traversal,
//! recording why, so a later incremental patch can put them back and run
//! the passes again over the whole graph.

mod cycle;
mod finalize;
mod reduce;

pub use cycle::{is_acyclic, resolve_cycles};
pub use finalize::{assign_ranks, connect_root};
pub use reduce::reduce;

use tracing::debug;

use crate::config::DepsgraphConfig;
use crate::error::Diagnostic;
use crate::graph::Graph;

/// Run every pass in order.
pub(crate) fn run_all(graph: &mut Graph, config: &DepsgraphConfig, diagnostics: &mut Vec<Diagnostic>) {
    let broken = resolve_cycles(graph, diagnostics);
    let operations = graph.operations().count();
    let reduced = if !config.transitive_reduction {
        0
    } else if operations > config.reduction_operation_limit {
        debug!(
            operations,
            limit = config.reduction_operation_limit,
            "graph too large, transitive reduction skipped"
        );
        0
    } else {
        reduce(graph)
    };
    let rooted = connect_root(graph);
    assign_ranks(graph);
    debug!(broken, reduced, rooted, "graph passes complete");
}
