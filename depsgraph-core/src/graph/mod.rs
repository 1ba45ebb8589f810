//! Dependency Graph
//!
//! This module implements the node/component/operation hierarchy and the
//! relation store that together describe what has to be evaluated and in
//! which order.
//!
//! # Overview
//!
//! The dependency graph is a directed graph where:
//!
//! - ID-nodes represent scene entities (objects, meshes, collections, ...)
//! - Component-nodes group an entity's operations by domain (transform,
//!   geometry, animation, ...)
//! - Operation-nodes are the schedulable units
//! - Relations are edges between operations: if B depends on A, there is a
//!   relation from A to B
//!
//! When an entity changes, its operations are tagged and the tag is flushed
//! along relations. The scheduler then runs the tagged subset in dependency
//! order.
//!
//! # Design Decisions
//!
//! 1. All nodes live in arenas and are referenced by small integer handles.
//!    Cross-references (entity to ID-node, operation to component) are plain
//!    index lookups.
//!
//! 2. Every component has an entry and an exit operation. Relations between
//!    components of different entities go from the exit of the dependency to
//!    the entry (or a specific inner operation) of the dependent, so wiring
//!    never needs to know the inner layout of another entity.
//!
//! 3. Adjacency is stored in both directions for cheap traversal either way.

mod arena;
mod node;
mod relation;

pub use arena::{Graph, GraphStats};
pub use node::{
    ComponentId, ComponentKind, ComponentNode, IdNode, IdNodeId, OperationCode, OperationId,
    OperationNode, OperationOwner, OperationState,
};
pub use relation::{Relation, RelationId, RelationKind, RelationStatus, RelationStore};
