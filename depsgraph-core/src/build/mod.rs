//! Graph Builder
//!
//! Turns a scene (or part of one) into a dependency graph.
//!
//! # Phases
//!
//! 1. The working set is the entities selected by the [`BuildMode`] plus
//!    everything they transitively reference
//! 2. Nodes are created for every entity of the working set
//! 3. Relations are created for every entity of the working set
//! 4. Cycles are broken, redundant relations dropped and ranks assigned
//!
//! Phase 3 only starts after phase 2 is complete because a relation can
//! point at any entity of the working set.
//!
//! A single bad reference never fails the build. It is skipped and reported
//! in [`BuildOutput::diagnostics`].

mod incremental;
mod nodes;
mod relations;

pub use incremental::RebuildKind;

pub(crate) use incremental::{patch, plan};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn};

use crate::config::DepsgraphConfig;
use crate::error::Diagnostic;
use crate::eval::OperationBinder;
use crate::graph::Graph;
use crate::passes;
use crate::scene::{EntityId, Scene};

/// Which part of the scene a graph covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildMode {
    /// Every entity of the scene.
    AllObjects,
    /// A collection and everything nested in it.
    Collection(EntityId),
    /// The collections of a named view layer, plus the scene entity.
    ViewLayer(String),
    /// An explicit list of entities.
    ExplicitIds(Vec<EntityId>),
    /// The compositor node tree.
    CompositorOnly,
    /// A view layer as rendered: its collections, the scene and the compositor.
    Render(String),
}

/// A freshly built graph and everything that went wrong building it.
#[derive(Debug)]
pub struct BuildOutput {
    pub graph: Graph,
    pub diagnostics: Vec<Diagnostic>,
}

fn view_layer_seeds(scene: &Scene, name: &str, seeds: &mut IndexSet<EntityId>) {
    let Some(layer) = scene.view_layer(name) else {
        warn!(view_layer = name, "unknown view layer, nothing to build");
        return;
    };
    for collection in &layer.collections {
        seeds.extend(scene.collection_closure(*collection));
    }
    seeds.extend(scene.scene_entity());
}

/// The entities a graph for `mode` covers, in scene order.
///
/// Starts from the entities the mode selects and follows references until
/// nothing new is found. References to entities missing from the scene are
/// left out here and reported when relations are built.
pub fn working_set(scene: &Scene, mode: &BuildMode) -> IndexSet<EntityId> {
    let mut seeds = IndexSet::new();
    match mode {
        BuildMode::AllObjects => seeds.extend(scene.entities().map(|entity| entity.id)),
        BuildMode::Collection(collection) => seeds.extend(scene.collection_closure(*collection)),
        BuildMode::ViewLayer(name) => view_layer_seeds(scene, name, &mut seeds),
        BuildMode::ExplicitIds(ids) => seeds.extend(ids.iter().copied()),
        BuildMode::CompositorOnly => seeds.extend(scene.compositor()),
        BuildMode::Render(name) => {
            view_layer_seeds(scene, name, &mut seeds);
            seeds.extend(scene.compositor());
        }
    }

    let mut reached: IndexSet<EntityId> = IndexSet::new();
    let mut stack: Vec<EntityId> = seeds.into_iter().rev().collect();
    while let Some(id) = stack.pop() {
        let Some(entity) = scene.get(id) else {
            debug!(entity = %id, "working set skips missing entity");
            continue;
        };
        if !reached.insert(id) {
            continue;
        }
        stack.extend(entity.references().into_iter().rev());
    }

    scene
        .entities()
        .map(|entity| entity.id)
        .filter(|id| reached.contains(id))
        .collect()
}

/// Build the graph for `mode`.
pub fn build_graph(
    scene: &Scene,
    mode: &BuildMode,
    binder: &dyn OperationBinder,
    config: &DepsgraphConfig,
) -> BuildOutput {
    let span = info_span!("build", ?mode);
    let _enter = span.enter();

    let entities = working_set(scene, mode);
    let mut graph = Graph::new();
    let mut diagnostics = Vec::new();

    for entity in entities.iter().filter_map(|id| scene.get(*id)) {
        nodes::build_entity_nodes(&mut graph, binder, entity);
    }

    let contains = |id: EntityId| entities.contains(&id);
    for entity in entities.iter().filter_map(|id| scene.get(*id)) {
        relations::build_entity_relations(&mut graph, entity, &contains, &mut diagnostics);
    }

    passes::run_all(&mut graph, config, &mut diagnostics);

    let stats = graph.stats();
    debug!(
        id_nodes = stats.id_nodes,
        operations = stats.operations,
        relations = stats.relations,
        diagnostics = diagnostics.len(),
        "graph built"
    );
    BuildOutput { graph, diagnostics }
}
