//! Invalidation Tracking
//!
//! Editors report changes with coarse scopes ("the transform of this object
//! changed"). Requests are queued and only applied at the start of the next
//! evaluation, where each scope is mapped to the components it affects and
//! every operation in those components is tagged.
//!
//! # Flushing
//!
//! Anything that depends on a stale value is stale itself, so tags are
//! flushed forward along active relations until every downstream operation
//! is tagged. Flushing only ever moves operations from `Clean` to `Tagged`,
//! which makes it idempotent: tagging the same thing twice before an
//! evaluation has the same effect as tagging it once.

use std::collections::VecDeque;

use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::graph::{ComponentKind, ComponentNode, Graph, OperationId, OperationNode};
use crate::scene::EntityId;

/// What part of an entity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyScope {
    Transform,
    Geometry,
    Animation,
    Parameters,
    Pose,
    Particles,
    PointCache,
    Collection,
    NodeTree,
    /// The original data was edited; evaluated copies must be re-cloned.
    Copy,
    /// Everything about the entity.
    All,
}

impl PropertyScope {
    /// Components whose operations become stale.
    pub fn components(self) -> &'static [ComponentKind] {
        match self {
            PropertyScope::Transform => &[ComponentKind::Transform],
            PropertyScope::Geometry => &[ComponentKind::Geometry],
            PropertyScope::Animation => &[ComponentKind::Animation],
            PropertyScope::Parameters => &[ComponentKind::Parameters],
            PropertyScope::Pose => &[ComponentKind::Pose],
            PropertyScope::Particles => &[ComponentKind::Particles],
            PropertyScope::PointCache => &[ComponentKind::PointCache],
            PropertyScope::Collection => &[ComponentKind::Collection],
            PropertyScope::NodeTree => &[ComponentKind::NodeTree],
            PropertyScope::Copy => &[ComponentKind::CopyOnWrite],
            PropertyScope::All => &ComponentKind::ALL,
        }
    }
}

/// A queued change report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagRequest {
    pub entity: EntityId,
    pub scope: PropertyScope,
}

/// Change reports waiting for the next evaluation.
#[derive(Debug, Default)]
pub struct TagQueue {
    pending: Mutex<IndexSet<TagRequest>>,
}

impl TagQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request. Returns `false` if an identical one is already queued.
    pub fn push(&self, entity: EntityId, scope: PropertyScope) -> bool {
        self.pending.lock().insert(TagRequest { entity, scope })
    }

    /// Take every queued request in arrival order.
    pub fn drain(&self) -> Vec<TagRequest> {
        std::mem::take(&mut *self.pending.lock()).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

fn tag_operation(graph: &Graph, op: OperationId) -> usize {
    graph
        .operation(op)
        .map_or(0, |node| usize::from(node.mark_tagged()))
}

/// Tag every operation of a component, entry and exit included.
pub(crate) fn tag_component(graph: &Graph, component: &ComponentNode) -> usize {
    component
        .all_operations()
        .map(|op| tag_operation(graph, op))
        .sum()
}

/// Tag the components a request names.
///
/// Requests for entities outside the graph, or for components the entity
/// does not have, are ignored.
pub(crate) fn apply_request(graph: &Graph, request: &TagRequest) -> usize {
    let Some(id_node) = graph.find_id_node(request.entity) else {
        debug!(entity = %request.entity, "tag for entity outside the graph ignored");
        return 0;
    };
    request
        .scope
        .components()
        .iter()
        .filter_map(|kind| id_node.component(*kind))
        .filter_map(|id| graph.component(id))
        .map(|component| tag_component(graph, component))
        .sum()
}

/// Tag every component of an entity.
pub(crate) fn tag_entity(graph: &Graph, entity: EntityId) -> usize {
    apply_request(
        graph,
        &TagRequest {
            entity,
            scope: PropertyScope::All,
        },
    )
}

/// Tag the time source so that flushing reaches time-dependent operations.
pub(crate) fn tag_time_source(graph: &Graph) -> usize {
    tag_operation(graph, graph.time_source())
}

/// Propagate tags forward along active relations.
///
/// Returns the number of operations newly tagged by the flush.
pub(crate) fn flush(graph: &Graph) -> usize {
    let mut queue: VecDeque<OperationId> = tagged_operations(graph).into();
    let mut flushed = 0;

    while let Some(op) = queue.pop_front() {
        for succ in graph.relations().successors(op) {
            if tag_operation(graph, succ) > 0 {
                flushed += 1;
                queue.push_back(succ);
            }
        }
    }

    debug!(flushed, "tag flush complete");
    flushed
}

/// Operations currently waiting for evaluation.
pub fn tagged_operations(graph: &Graph) -> Vec<OperationId> {
    graph
        .operations()
        .filter(|op| op.is_tagged())
        .map(OperationNode::id)
        .collect()
}
