//! Node Arena
//!
//! The [`Graph`] owns every ID-, component- and operation-node together with
//! the relation store. Nodes are addressed by handle; removing an entity
//! leaves tombstones so that handles of the remaining nodes stay valid
//! across an incremental rebuild. Tombstoned slots are handed out again to
//! the next nodes created, lowest operation handle first.

use std::borrow::Cow;
use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::Serialize;

use super::node::{
    ComponentId, ComponentKind, ComponentNode, IdNode, IdNodeId, OperationCode, OperationId,
    OperationNode, OperationOwner,
};
use super::relation::{RelationId, RelationKind, RelationStatus, RelationStore};
use crate::eval::OperationFn;
use crate::scene::{EntityId, EntityKind};

/// Size summary of a graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub id_nodes: usize,
    pub components: usize,
    pub operations: usize,
    pub relations: usize,
    /// Relations taken out to break cycles.
    pub cyclic_relations: usize,
    /// Relations taken out by transitive reduction.
    pub reduced_relations: usize,
}

/// The dependency graph of one scene configuration.
#[derive(Debug)]
pub struct Graph {
    id_nodes: Vec<Option<IdNode>>,
    components: Vec<Option<ComponentNode>>,
    operations: Vec<Option<OperationNode>>,
    relations: RelationStore,
    free_id_nodes: Vec<IdNodeId>,
    free_components: Vec<ComponentId>,
    free_operations: BTreeSet<OperationId>,
    /// Entity lookup used by tagging, queries and incremental rebuilds.
    entity_map: IndexMap<EntityId, IdNodeId>,
    root: OperationId,
    time_source: OperationId,
}

impl Graph {
    /// Create a graph containing only the root and time source operations.
    pub fn new() -> Self {
        let mut graph = Self {
            id_nodes: Vec::new(),
            components: Vec::new(),
            operations: Vec::new(),
            relations: RelationStore::new(),
            free_id_nodes: Vec::new(),
            free_components: Vec::new(),
            free_operations: BTreeSet::new(),
            entity_map: IndexMap::new(),
            root: OperationId::from_index(0),
            time_source: OperationId::from_index(1),
        };
        graph.root = graph.push_operation(None, OperationCode::Root, None);
        graph.time_source = graph.push_operation(None, OperationCode::TimeSource, None);
        graph
    }

    fn push_operation(
        &mut self,
        owner: Option<OperationOwner>,
        code: OperationCode,
        callable: Option<OperationFn>,
    ) -> OperationId {
        let id = self
            .free_operations
            .pop_first()
            .unwrap_or_else(|| OperationId::from_index(self.operations.len()));
        store(&mut self.operations, id.index(), OperationNode::new(id, owner, code, callable));
        id
    }

    pub fn root(&self) -> OperationId {
        self.root
    }

    pub fn time_source(&self) -> OperationId {
        self.time_source
    }

    /// Add the ID-node for an entity, or return the existing one.
    pub fn add_id_node(&mut self, entity: EntityId, name: &str, kind: EntityKind) -> IdNodeId {
        if let Some(existing) = self.entity_map.get(&entity) {
            return *existing;
        }
        let id = self
            .free_id_nodes
            .pop()
            .unwrap_or_else(|| IdNodeId::from_index(self.id_nodes.len()));
        let node = IdNode {
            id,
            entity,
            name: name.to_string(),
            kind,
            components: IndexMap::new(),
        };
        store(&mut self.id_nodes, id.index(), node);
        self.entity_map.insert(entity, id);
        id
    }

    /// Add a component to an ID-node, or return the existing one.
    ///
    /// Creates the entry and exit pseudo-operations. They are wired together
    /// in the relation phase, once the inner operations are known.
    pub fn add_component(&mut self, id_node: IdNodeId, kind: ComponentKind) -> Option<ComponentId> {
        let entity = {
            let node = self.id_node(id_node)?;
            if let Some(existing) = node.component(kind) {
                return Some(existing);
            }
            node.entity
        };

        let id = self
            .free_components
            .pop()
            .unwrap_or_else(|| ComponentId::from_index(self.components.len()));
        let owner = OperationOwner {
            id_node,
            component: id,
            entity,
            kind,
        };
        let entry = self.push_operation(Some(owner), OperationCode::Entry, None);
        let exit = self.push_operation(Some(owner), OperationCode::Exit, None);
        let component = ComponentNode {
            id,
            id_node,
            kind,
            entry,
            exit,
            operations: Vec::new(),
        };
        store(&mut self.components, id.index(), component);
        self.id_nodes[id_node.index()]
            .as_mut()?
            .components
            .insert(kind, id);
        Some(id)
    }

    /// Add an inner operation to a component.
    pub fn add_operation(
        &mut self,
        component: ComponentId,
        code: OperationCode,
        callable: Option<OperationFn>,
    ) -> Option<OperationId> {
        let owner = {
            let comp = self.component(component)?;
            let entity = self.id_node(comp.id_node)?.entity;
            OperationOwner {
                id_node: comp.id_node,
                component,
                entity,
                kind: comp.kind,
            }
        };
        let id = self.push_operation(Some(owner), code, callable);
        self.components[component.index()]
            .as_mut()?
            .operations
            .push(id);
        Some(id)
    }

    pub fn id_node(&self, id: IdNodeId) -> Option<&IdNode> {
        self.id_nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn component(&self, id: ComponentId) -> Option<&ComponentNode> {
        self.components.get(id.index()).and_then(Option::as_ref)
    }

    pub fn operation(&self, id: OperationId) -> Option<&OperationNode> {
        self.operations.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn operation_mut(&mut self, id: OperationId) -> Option<&mut OperationNode> {
        self.operations.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn find_id_node(&self, entity: EntityId) -> Option<&IdNode> {
        self.entity_map
            .get(&entity)
            .and_then(|id| self.id_node(*id))
    }

    pub fn contains_entity(&self, entity: EntityId) -> bool {
        self.entity_map.contains_key(&entity)
    }

    /// Entities in the order their ID-nodes were created.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entity_map.keys().copied()
    }

    pub fn find_component(&self, entity: EntityId, kind: ComponentKind) -> Option<&ComponentNode> {
        self.find_id_node(entity)
            .and_then(|node| node.component(kind))
            .and_then(|id| self.component(id))
    }

    /// Locate an inner operation, or the entry/exit of a component.
    pub fn find_operation(
        &self,
        entity: EntityId,
        kind: ComponentKind,
        code: &OperationCode,
    ) -> Option<OperationId> {
        let component = self.find_component(entity, kind)?;
        match code {
            OperationCode::Entry => Some(component.entry),
            OperationCode::Exit => Some(component.exit),
            _ => component
                .operations
                .iter()
                .copied()
                .find(|op| self.operation(*op).is_some_and(|node| &node.code == code)),
        }
    }

    /// Live operations in handle order.
    pub fn operations(&self) -> impl Iterator<Item = &OperationNode> {
        self.operations.iter().flatten()
    }

    pub fn operation_ids(&self) -> impl Iterator<Item = OperationId> + '_ {
        self.operations().map(OperationNode::id)
    }

    /// Upper bound of operation handles, for handle-indexed scratch arrays.
    pub fn operation_capacity(&self) -> usize {
        self.operations.len()
    }

    pub fn id_nodes(&self) -> impl Iterator<Item = &IdNode> {
        self.id_nodes.iter().flatten()
    }

    pub fn components(&self) -> impl Iterator<Item = &ComponentNode> {
        self.components.iter().flatten()
    }

    pub fn relations(&self) -> &RelationStore {
        &self.relations
    }

    pub(crate) fn relations_mut(&mut self) -> &mut RelationStore {
        &mut self.relations
    }

    /// Add a relation between two live operations.
    pub fn add_relation(
        &mut self,
        from: OperationId,
        to: OperationId,
        kind: RelationKind,
        name: impl Into<Cow<'static, str>>,
        owner: Option<EntityId>,
    ) -> Option<RelationId> {
        if self.operation(from).is_none() || self.operation(to).is_none() {
            return None;
        }
        Some(self.relations.add(from, to, kind, name, owner))
    }

    /// Remove an entity's ID-node with all its components and operations.
    ///
    /// Relations touching the removed operations are deleted. Returns the
    /// number of removed operations.
    pub fn remove_id_node(&mut self, entity: EntityId) -> usize {
        let Some(id) = self.entity_map.shift_remove(&entity) else {
            return 0;
        };
        let Some(node) = self.id_nodes.get_mut(id.index()).and_then(Option::take) else {
            return 0;
        };
        self.free_id_nodes.push(id);

        let mut removed = 0;
        for component_id in node.components.values() {
            let Some(component) = self
                .components
                .get_mut(component_id.index())
                .and_then(Option::take)
            else {
                continue;
            };
            self.free_components.push(*component_id);
            for op in component.all_operations() {
                self.relations.remove_incident(op);
                if let Some(slot) = self.operations.get_mut(op.index()) {
                    if slot.take().is_some() {
                        self.free_operations.insert(op);
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    /// Human-readable path of an operation, e.g. `Cube/Transform/TransformFinal`.
    pub fn describe(&self, op: OperationId) -> String {
        let Some(node) = self.operation(op) else {
            return op.to_string();
        };
        match node.owner {
            Some(owner) => {
                let name = self
                    .id_node(owner.id_node)
                    .map_or_else(|| owner.entity.to_string(), |id| id.name.clone());
                format!("{name}/{}/{}", owner.kind, node.code)
            }
            None => node.code.to_string(),
        }
    }

    /// Entity name of an operation's owner, or the operation code for
    /// graph-level operations.
    pub fn entity_name(&self, op: OperationId) -> String {
        self.operation(op)
            .and_then(|node| node.owner)
            .and_then(|owner| self.id_node(owner.id_node))
            .map_or_else(|| self.describe(op), |node| node.name.clone())
    }

    /// Whether `to` can be reached from `from` along active relations.
    pub fn reaches(&self, from: OperationId, to: OperationId) -> bool {
        if from == to {
            return true;
        }
        let mut visited = vec![false; self.operation_capacity()];
        let mut stack = vec![from];
        while let Some(op) = stack.pop() {
            for succ in self.relations.successors(op) {
                if succ == to {
                    return true;
                }
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    stack.push(succ);
                }
            }
        }
        false
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            id_nodes: self.entity_map.len(),
            components: self.components().count(),
            operations: self.operations().count(),
            relations: self.relations.active_count(),
            cyclic_relations: self.relations.count_with_status(RelationStatus::Cyclic),
            reduced_relations: self.relations.count_with_status(RelationStatus::Reduced),
        }
    }
}

/// Put a node into a free slot or append it.
fn store<T>(slots: &mut Vec<Option<T>>, index: usize, node: T) {
    match slots.get_mut(index) {
        Some(slot) => *slot = Some(node),
        None => slots.push(Some(node)),
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_entity() -> (Graph, EntityId, ComponentId) {
        let mut graph = Graph::new();
        let entity = EntityId::new(0);
        let id_node = graph.add_id_node(entity, "Cube", EntityKind::Object);
        let component = graph
            .add_component(id_node, ComponentKind::Transform)
            .expect("id node exists");
        (graph, entity, component)
    }

    #[test]
    fn new_graph_has_root_and_time_source() {
        let graph = Graph::new();
        assert_eq!(graph.operations().count(), 2);
        assert_eq!(graph.operation(graph.root()).map(|op| op.code().clone()), Some(OperationCode::Root));
        assert_eq!(graph.describe(graph.time_source()), "TimeSource");
    }

    #[test]
    fn id_nodes_are_unique_per_entity() {
        let (mut graph, entity, _) = graph_with_entity();
        let again = graph.add_id_node(entity, "Cube", EntityKind::Object);
        assert_eq!(graph.find_id_node(entity).map(IdNode::id), Some(again));
        assert_eq!(graph.stats().id_nodes, 1);
    }

    #[test]
    fn component_lookup() {
        let (mut graph, entity, component) = graph_with_entity();
        let op = graph
            .add_operation(component, OperationCode::TransformLocal, None)
            .expect("component exists");

        assert_eq!(
            graph.find_operation(entity, ComponentKind::Transform, &OperationCode::TransformLocal),
            Some(op)
        );
        assert_eq!(graph.describe(op), "Cube/Transform/TransformLocal");
        let entry = graph.find_operation(entity, ComponentKind::Transform, &OperationCode::Entry);
        assert_eq!(entry, graph.component(component).map(ComponentNode::entry));
        assert!(graph.find_component(entity, ComponentKind::Geometry).is_none());
    }

    #[test]
    fn remove_id_node_drops_operations_and_relations() {
        let (mut graph, entity, component) = graph_with_entity();
        let op = graph
            .add_operation(component, OperationCode::TransformLocal, None)
            .expect("component exists");
        let time = graph.time_source();
        graph.add_relation(time, op, RelationKind::Time, "Time Source", Some(entity));

        assert_eq!(graph.remove_id_node(entity), 3);
        assert!(graph.operation(op).is_none());
        assert!(!graph.contains_entity(entity));
        assert_eq!(graph.relations().active_count(), 0);
        // Root and time source survive.
        assert_eq!(graph.operations().count(), 2);
    }

    #[test]
    fn removed_slots_are_reused() {
        let (mut graph, entity, _) = graph_with_entity();
        let capacity = graph.operation_capacity();

        for _ in 0..20 {
            graph.remove_id_node(entity);
            let id_node = graph.add_id_node(entity, "Cube", EntityKind::Object);
            let component = graph
                .add_component(id_node, ComponentKind::Transform)
                .expect("id node exists");
            let exit = graph.component(component).map(ComponentNode::exit);
            let time = graph.time_source();
            if let Some(exit) = exit {
                graph.add_relation(time, exit, RelationKind::Time, "Time Source", Some(entity));
            }
        }

        assert_eq!(graph.operation_capacity(), capacity);
        assert_eq!(graph.relations().capacity(), 1);
        assert_eq!(graph.id_nodes.len(), 1);
        assert_eq!(graph.components.len(), 1);
        assert_eq!(graph.stats().operations, 4);
    }

    #[test]
    fn reachability() {
        let (mut graph, _, component) = graph_with_entity();
        let a = graph.add_operation(component, OperationCode::TransformLocal, None);
        let b = graph.add_operation(component, OperationCode::TransformFinal, None);
        let (Some(a), Some(b)) = (a, b) else {
            panic!("operations should be created");
        };
        graph.add_relation(a, b, RelationKind::Operation, "chain", None);

        assert!(graph.reaches(a, b));
        assert!(!graph.reaches(b, a));
    }
}
