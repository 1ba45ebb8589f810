//! Depsgraph Core
//!
//! This crate provides the scene dependency graph: the subsystem that turns a
//! declarative scene description into a graph of evaluation operations and
//! re-evaluates only what an edit invalidated.
//! It implements:
//!
//! - A node/component/operation graph built from scene entities
//! - Cycle resolution and transitive reduction
//! - Tagging and forward flushing of invalidation
//! - A parallel scheduler producing copy-on-write evaluated copies
//!
//! What each operation computes is not part of this crate. Callables are
//! bound per operation at build time through an [`OperationBinder`].
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `scene`: The input description (entities and their references)
//! - `graph`: Node arena and relation store
//! - `build`: Two-phase graph construction and incremental patching
//! - `passes`: Cycle resolution, reduction, root wiring and ranks
//! - `eval`: Tagging, evaluated copies and the scheduler
//! - `depsgraph`: The handle tying build, tag, evaluate and queries together
//!
//! # Example
//!
//! ```rust
//! use depsgraph_core::{
//!     operation, BuildMode, Depsgraph, Entity, OperationCode, OperationFn, OperationKey,
//!     PropertyScope, Scene,
//! };
//!
//! let mut scene = Scene::new();
//! let cube = scene.add(Entity::object("Cube").with_property("size", 1.0));
//!
//! // Bind a computation to the final transform operation of every object.
//! let binder = |key: &OperationKey| -> Option<OperationFn> {
//!     (key.code == OperationCode::TransformFinal).then(|| {
//!         operation(|ctx| {
//!             let size = ctx.read_float(ctx.entity(), "size")?;
//!             ctx.set("world_size", size * 2.0);
//!             Ok(())
//!         })
//!     })
//! };
//!
//! let graph = Depsgraph::build(scene.into_shared(), BuildMode::AllObjects, binder);
//! graph.evaluate(1);
//! let evaluated = graph.get_evaluated(cube).expect("cube is in the scene");
//! assert_eq!(evaluated.get_float("world_size"), Some(2.0));
//!
//! // Editors report changes; the next evaluation only re-runs what they affect.
//! graph.tag(cube, PropertyScope::Transform);
//! let report = graph.evaluate(1);
//! assert!(!report.executed.is_empty());
//! ```

pub mod build;
pub mod config;
pub mod debug;
pub mod depsgraph;
pub mod error;
pub mod eval;
pub mod graph;
pub mod passes;
pub mod scene;

pub use build::{build_graph, working_set, BuildMode, BuildOutput, RebuildKind};
pub use config::DepsgraphConfig;
pub use debug::DebugGraph;
pub use depsgraph::{Depsgraph, EvaluationReport};
pub use error::{ConfigError, Diagnostic, OperationError, SchedulerError, Severity};
pub use eval::{
    operation, EvalContext, EvaluatedCopy, FrameTime, NoopBinder, OperationBinder, OperationFailure,
    OperationFn, OperationKey, PropertyScope,
};
pub use graph::{ComponentKind, Graph, GraphStats, OperationCode, OperationId, OperationState};
pub use scene::{Driver, Entity, EntityId, EntityKind, Link, Scene, SharedScene, Value};
