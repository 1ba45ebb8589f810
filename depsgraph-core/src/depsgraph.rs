//! The dependency graph handle.
//!
//! [`Depsgraph`] ties the pieces together: it owns the built graph, queues
//! tag and topology requests coming from the editing layer, runs evaluation
//! passes and answers queries about evaluated state.
//!
//! # Locking
//!
//! - `pass_lock` serializes evaluation passes and explicit rebuilds
//! - the graph topology is only written under `pass_lock`, before a pass
//!   starts; during a pass it is shared read-only with the workers
//! - the scene is read-locked for the duration of a pass and write-locked
//!   only after it, to apply flush-to-original writes
//!
//! Tagging never blocks on a running pass; requests are queued and picked up
//! by the next [`Depsgraph::evaluate`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, info_span};

use crate::build::{self, BuildMode, RebuildKind};
use crate::config::DepsgraphConfig;
use crate::debug::DebugGraph;
use crate::error::{Diagnostic, SchedulerError};
use crate::eval::scheduler::Scheduler;
use crate::eval::{
    tag, EvaluatedCopy, EvaluatedStore, FrameTime, OperationBinder, OperationFailure, OriginalWrite,
    PassCopies, PropertyScope, TagQueue,
};
use crate::graph::{ComponentKind, Graph, GraphStats, OperationCode, OperationId, OperationState};
use crate::scene::{EntityId, Scene, SharedScene};

/// What one call to [`Depsgraph::evaluate`] did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub frame: FrameTime,
    /// How the topology was updated before the pass.
    pub rebuild: RebuildKind,
    /// Operations that ran, in completion order.
    pub executed: Vec<OperationId>,
    #[serde(skip)]
    pub failures: Vec<OperationFailure>,
    /// Why the pass stopped early, if it did. Nothing was committed then.
    #[serde(skip)]
    pub aborted: Option<SchedulerError>,
    /// Evaluated-copy generation committed by the pass.
    pub generation: Option<u64>,
}

impl EvaluationReport {
    /// The pass ran to the end and its results were committed.
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }
}

/// A dependency graph over a shared scene.
pub struct Depsgraph {
    scene: SharedScene,
    mode: BuildMode,
    binder: Arc<dyn OperationBinder>,
    config: DepsgraphConfig,

    graph: RwLock<Graph>,
    tags: TagQueue,
    relations_dirty: Mutex<IndexSet<EntityId>>,
    full_rebuild: AtomicBool,

    store: EvaluatedStore,
    diagnostics: Mutex<Vec<Diagnostic>>,
    retiring: AtomicBool,
    last_frame: Mutex<Option<FrameTime>>,
    pass_lock: Mutex<()>,
}

impl Depsgraph {
    /// Build a graph with the default configuration.
    pub fn build(scene: SharedScene, mode: BuildMode, binder: impl OperationBinder + 'static) -> Self {
        Self::with_config(scene, mode, binder, DepsgraphConfig::default())
    }

    /// Build a graph.
    ///
    /// Build problems are recorded in [`Depsgraph::diagnostics`]; building
    /// itself never fails.
    pub fn with_config(
        scene: SharedScene,
        mode: BuildMode,
        binder: impl OperationBinder + 'static,
        config: DepsgraphConfig,
    ) -> Self {
        let binder: Arc<dyn OperationBinder> = Arc::new(binder);
        let output = {
            let scene = scene.read();
            build::build_graph(&scene, &mode, binder.as_ref(), &config)
        };

        Self {
            scene,
            mode,
            binder,
            config,
            graph: RwLock::new(output.graph),
            tags: TagQueue::new(),
            relations_dirty: Mutex::new(IndexSet::new()),
            full_rebuild: AtomicBool::new(false),
            store: EvaluatedStore::new(),
            diagnostics: Mutex::new(output.diagnostics),
            retiring: AtomicBool::new(false),
            last_frame: Mutex::new(None),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn scene(&self) -> &SharedScene {
        &self.scene
    }

    pub fn mode(&self) -> &BuildMode {
        &self.mode
    }

    pub fn config(&self) -> &DepsgraphConfig {
        &self.config
    }

    /// Report that part of an entity changed.
    ///
    /// Applied at the start of the next evaluation. Tagging the same
    /// `(entity, scope)` twice before that has no further effect.
    pub fn tag(&self, entity: EntityId, scope: PropertyScope) {
        if !self.tags.push(entity, scope) {
            debug!(%entity, ?scope, "tag already queued");
        }
    }

    /// Report that an entity's relationships changed.
    ///
    /// The graph is patched (or rebuilt) before the next evaluation.
    pub fn tag_relations(&self, entity: EntityId) {
        self.relations_dirty.lock().insert(entity);
    }

    /// Request a rebuild from scratch before the next evaluation.
    pub fn tag_full_rebuild(&self) {
        self.full_rebuild.store(true, Ordering::Release);
    }

    /// Rebuild the graph from scratch right away.
    pub fn rebuild(&self) {
        let _pass = self.pass_lock.lock();
        self.tag_full_rebuild();
        self.apply_topology_changes();
    }

    fn apply_topology_changes(&self) -> RebuildKind {
        let full = self.full_rebuild.swap(false, Ordering::AcqRel);
        let changed = std::mem::take(&mut *self.relations_dirty.lock());
        if !full && changed.is_empty() {
            return RebuildKind::None;
        }

        let scene = self.scene.read();
        let mut graph = self.graph.write();
        let kind = if full {
            RebuildKind::Full
        } else {
            build::plan(&graph, &scene, &self.mode, &changed, &self.config)
        };

        let mut diagnostics = Vec::new();
        match kind {
            RebuildKind::None => {}
            RebuildKind::Incremental => {
                build::patch(
                    &mut graph,
                    &scene,
                    &changed,
                    self.binder.as_ref(),
                    &self.config,
                    &mut diagnostics,
                );
            }
            RebuildKind::Full => {
                let output = build::build_graph(&scene, &self.mode, self.binder.as_ref(), &self.config);
                *graph = output.graph;
                diagnostics = output.diagnostics;
                info!(operations = graph.stats().operations, "graph rebuilt");
            }
        }
        self.store.retain(|entity| graph.contains_entity(entity));
        self.diagnostics.lock().extend(diagnostics);
        kind
    }

    /// Evaluate everything that changed, at `time`.
    ///
    /// Blocks until the pass is over. Failures are reported through the
    /// returned report and [`Depsgraph::diagnostics`], never as an error: a
    /// failing operation leaves its entity's previous values in place and
    /// dependents still run.
    pub fn evaluate(&self, time: impl Into<FrameTime>) -> EvaluationReport {
        let time = time.into();
        let _pass = self.pass_lock.lock();
        let span = info_span!("evaluate", frame = %time);
        let _enter = span.enter();

        let mut report = EvaluationReport {
            frame: time,
            ..EvaluationReport::default()
        };
        if self.is_retired() {
            report.aborted = Some(SchedulerError::Retired);
            return report;
        }

        report.rebuild = self.apply_topology_changes();

        let (working, writes, outcome) = {
            let scene = self.scene.read();
            let graph = self.graph.read();

            let requested: usize = self
                .tags
                .drain()
                .iter()
                .map(|request| tag::apply_request(&graph, request))
                .sum();
            if *self.last_frame.lock() != Some(time) {
                tag::tag_time_source(&graph);
            }
            let flushed = tag::flush(&graph);
            debug!(requested, flushed, "tags applied");

            let copies = PassCopies::new(&scene, &self.store);
            let outcome = Scheduler::new(
                &graph,
                &copies,
                time,
                self.config.catch_panics,
                &self.retiring,
            )
            .run(self.config.worker_count());
            let (working, writes) = copies.into_parts();
            (working, writes, outcome)
        };

        report.executed = outcome.executed;
        report.failures = outcome.failures;
        {
            let mut diagnostics = self.diagnostics.lock();
            diagnostics.extend(report.failures.iter().map(|failure| Diagnostic::OperationFailed {
                entity: failure.entity_name.clone(),
                component: failure.component,
                operation: failure.code.to_string(),
                error: failure.error.clone(),
            }));
            if let Some(abort) = &outcome.abort {
                diagnostics.push(Diagnostic::PassAborted(abort.clone()));
            }
        }

        match outcome.abort {
            Some(abort) => {
                error!(error = %abort, "evaluation pass aborted, keeping last evaluated state");
                report.aborted = Some(abort);
            }
            None => {
                report.generation = Some(self.store.commit(working));
                self.write_originals(writes);
                *self.last_frame.lock() = Some(time);
            }
        }

        debug!(
            executed = report.executed.len(),
            failures = report.failures.len(),
            "evaluation pass complete"
        );
        report
    }

    fn write_originals(&self, writes: Vec<OriginalWrite>) {
        if writes.is_empty() {
            return;
        }
        let mut scene = self.scene.write();
        for write in writes {
            if let Some(entity) = scene.get_mut(write.entity) {
                entity.properties.insert(write.property, write.value);
            }
        }
    }

    /// Current evaluated state of an entity.
    ///
    /// Falls back to a snapshot of the original for entities not evaluated
    /// yet. `None` if the entity is not in the scene.
    pub fn get_evaluated(&self, entity: EntityId) -> Option<Arc<EvaluatedCopy>> {
        if let Some(copy) = self.store.get(entity) {
            return Some(copy);
        }
        let scene = self.scene.read();
        scene
            .get(entity)
            .map(|original| Arc::new(EvaluatedCopy::new(entity, 0, original.properties.clone())))
    }

    /// The operation standing for an entity's component: its exit.
    pub fn operation_for(&self, entity: EntityId, component: ComponentKind) -> Option<OperationId> {
        self.graph
            .read()
            .find_component(entity, component)
            .map(|component| component.exit())
    }

    pub fn find_operation(
        &self,
        entity: EntityId,
        component: ComponentKind,
        code: &OperationCode,
    ) -> Option<OperationId> {
        self.graph.read().find_operation(entity, component, code)
    }

    pub fn operation_state(&self, op: OperationId) -> Option<OperationState> {
        self.graph.read().operation(op).map(|node| node.state())
    }

    /// How often an operation ran since it was created.
    pub fn execution_count(&self, op: OperationId) -> u64 {
        self.graph
            .read()
            .operation(op)
            .map_or(0, |node| node.execution_count())
    }

    pub fn stats(&self) -> GraphStats {
        self.graph.read().stats()
    }

    /// Snapshot of nodes and relations for visualization.
    pub fn debug_export(&self) -> DebugGraph {
        DebugGraph::from_graph(&self.graph.read())
    }

    /// Run a closure against the current graph.
    pub fn with_graph<R>(&self, f: impl FnOnce(&Graph) -> R) -> R {
        f(&self.graph.read())
    }

    /// Everything recorded so far.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Take and clear the recorded diagnostics.
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }

    /// Stop evaluating.
    ///
    /// A running pass lets in-flight operations finish, dispatches nothing
    /// new and discards its working copies. Later passes return right away.
    pub fn retire(&self) {
        self.retiring.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retiring.load(Ordering::Acquire)
    }

    /// Original scene read access, for callers holding only the graph.
    pub fn read_scene<R>(&self, f: impl FnOnce(&Scene) -> R) -> R {
        f(&self.scene.read())
    }
}

impl std::fmt::Debug for Depsgraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Depsgraph")
            .field("mode", &self.mode)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("retiring", &self.is_retired())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{operation, NoopBinder, OperationFn, OperationKey};
    use crate::scene::{Driver, Entity, Link};

    #[test]
    fn first_evaluation_runs_everything() {
        let mut scene = Scene::new();
        scene.add(Entity::object("A"));
        let graph = Depsgraph::build(scene.into_shared(), BuildMode::AllObjects, NoopBinder);
        let operations = graph.stats().operations;

        let report = graph.evaluate(1);
        assert!(report.is_complete());
        assert_eq!(report.executed.len(), operations);
        assert_eq!(report.generation, Some(1));

        // Nothing changed.
        assert!(graph.evaluate(1).executed.is_empty());
    }

    #[test]
    fn frame_change_runs_time_dependent_operations() {
        let mut scene = Scene::new();
        let a = scene.add(Entity::object("A").animated());
        let graph = Depsgraph::build(scene.into_shared(), BuildMode::AllObjects, NoopBinder);
        graph.evaluate(1);

        let animation = graph
            .find_operation(a, ComponentKind::Animation, &OperationCode::AnimationEval)
            .expect("animation exists");
        let report = graph.evaluate(2);
        assert!(report.executed.contains(&animation));
        assert_eq!(graph.execution_count(animation), 2);
    }

    #[test]
    fn driven_values_flush_to_original() {
        let mut scene = Scene::new();
        let source = scene.add(Entity::object("Source").with_property("x", 3.0));
        let driven = scene.add(
            Entity::object("Driven").with_property("x", 0.0).with_driver(
                Driver::new("x", ComponentKind::Transform)
                    .reading(Link::transform(source))
                    .flushing_to_original(),
            ),
        );
        let binder = move |key: &OperationKey| -> Option<OperationFn> {
            match &key.code {
                OperationCode::Driver(property) => {
                    let property = property.clone();
                    Some(operation(move |ctx| {
                        let value = ctx.read_float(source, "x")?;
                        ctx.set(property.clone(), value * 2.0);
                        Ok(())
                    }))
                }
                _ => None,
            }
        };
        let shared = scene.into_shared();
        let graph = Depsgraph::build(shared.clone(), BuildMode::AllObjects, binder);

        graph.evaluate(1);
        assert_eq!(graph.get_evaluated(driven).and_then(|copy| copy.get_float("x")), Some(6.0));
        assert_eq!(
            shared.read().get(driven).and_then(|e| e.properties.get("x").cloned()),
            Some(6.0.into())
        );
    }

    #[test]
    fn retired_graph_does_not_evaluate() {
        let mut scene = Scene::new();
        let a = scene.add(Entity::object("A").with_property("x", 1.0));
        let graph = Depsgraph::build(scene.into_shared(), BuildMode::AllObjects, NoopBinder);
        graph.retire();

        let report = graph.evaluate(1);
        assert_eq!(report.aborted, Some(SchedulerError::Retired));
        assert!(report.executed.is_empty());
        // The original is still readable.
        assert_eq!(graph.get_evaluated(a).map(|copy| copy.generation()), Some(0));
    }

    #[test]
    fn relation_changes_patch_the_graph() {
        let mut scene = Scene::new();
        let a = scene.add(Entity::object("A"));
        let b = scene.add(Entity::object("B"));
        let shared = scene.into_shared();
        let graph = Depsgraph::build(shared.clone(), BuildMode::AllObjects, NoopBinder);
        graph.evaluate(1);

        if let Some(entity) = shared.write().get_mut(b) {
            entity.parent = Some(a);
        }
        graph.tag_relations(b);
        let report = graph.evaluate(1);
        assert_eq!(report.rebuild, RebuildKind::Incremental);

        let parent = graph
            .operation_for(a, ComponentKind::Transform)
            .expect("transform exists");
        let child = graph
            .find_operation(b, ComponentKind::Transform, &OperationCode::TransformParent)
            .expect("patched in");
        assert!(graph.with_graph(|g| g.reaches(parent, child)));
        // A itself did not re-run.
        assert!(!report.executed.contains(&parent));
    }
}
