//! Incremental patching.
//!
//! When the relationships of a few entities change (a modifier was added, a
//! parent reassigned) the existing graph is patched in place instead of
//! being rebuilt:
//!
//! - the changed entities lose their nodes and get new ones
//! - the changed entities and every entity referencing them lose the
//!   relations they created and get new ones
//! - previously deactivated relations go back into traversal and the graph
//!   passes run again over the whole graph
//!
//! Rerunning the passes globally is what keeps a patched graph equivalent to
//! a fresh build.

use indexmap::IndexSet;
use serde::Serialize;
use tracing::{debug, info};

use super::{nodes, relations, working_set, BuildMode};
use crate::config::DepsgraphConfig;
use crate::error::Diagnostic;
use crate::eval::tag;
use crate::eval::OperationBinder;
use crate::graph::{Graph, RelationKind};
use crate::passes;
use crate::scene::{EntityId, Scene};

/// How the topology was updated before a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RebuildKind {
    /// Topology unchanged.
    #[default]
    None,
    /// Affected entities were patched in place.
    Incremental,
    /// The graph was rebuilt from scratch.
    Full,
}

/// Decide between patching and rebuilding.
pub(crate) fn plan(
    graph: &Graph,
    scene: &Scene,
    mode: &BuildMode,
    changed: &IndexSet<EntityId>,
    config: &DepsgraphConfig,
) -> RebuildKind {
    if changed.is_empty() {
        return RebuildKind::None;
    }
    if changed.len() > config.incremental_rebuild_limit {
        debug!(changed = changed.len(), "too many changed entities to patch");
        return RebuildKind::Full;
    }

    let wanted = working_set(scene, mode);
    let current: IndexSet<EntityId> = graph.entities().collect();
    if wanted.len() != current.len() || !wanted.iter().all(|id| current.contains(id)) {
        debug!("working set changed, patch not possible");
        return RebuildKind::Full;
    }

    RebuildKind::Incremental
}

/// Patch the graph after the relations of `changed` entities changed.
///
/// Returns the entities whose relations were rebuilt; they are tagged.
pub(crate) fn patch(
    graph: &mut Graph,
    scene: &Scene,
    changed: &IndexSet<EntityId>,
    binder: &dyn OperationBinder,
    config: &DepsgraphConfig,
    diagnostics: &mut Vec<Diagnostic>,
) -> IndexSet<EntityId> {
    let mut affected: IndexSet<EntityId> = changed
        .iter()
        .copied()
        .filter(|id| graph.contains_entity(*id))
        .collect();
    for id in changed {
        affected.extend(
            scene
                .referencing(*id)
                .into_iter()
                .filter(|referrer| graph.contains_entity(*referrer)),
        );
    }

    for id in &affected {
        graph.relations_mut().remove_owned_by(*id);
    }
    for id in changed {
        graph.remove_id_node(*id);
        if let Some(entity) = scene.get(*id) {
            nodes::build_entity_nodes(graph, binder, entity);
        }
    }

    graph.relations_mut().remove_kind(RelationKind::Root);
    let restored = graph.relations_mut().reactivate_all();

    let in_graph: IndexSet<EntityId> = graph.entities().collect();
    let contains = |id: EntityId| in_graph.contains(&id);
    for entity in scene.entities().filter(|entity| affected.contains(&entity.id)) {
        relations::build_entity_relations(graph, entity, &contains, diagnostics);
    }

    passes::run_all(graph, config, diagnostics);

    for id in &affected {
        tag::tag_entity(graph, *id);
    }
    info!(
        changed = changed.len(),
        affected = affected.len(),
        restored,
        "graph patched"
    );
    affected
}
