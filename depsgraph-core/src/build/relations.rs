//! Phase 2: relations.
//!
//! Wires an entity's operations, first inside each component, then across
//! its own components, then towards every entity it references. Each
//! relation records the entity whose pass created it so an incremental patch
//! can drop and recreate exactly that entity's relations.
//!
//! A reference to an entity outside the graph, or to a component the target
//! does not have, skips that one relation and records a diagnostic.

use std::borrow::Cow;

use tracing::warn;

use crate::error::Diagnostic;
use crate::graph::{ComponentKind, ComponentNode, Graph, OperationCode, OperationId, RelationKind};
use crate::scene::{Entity, EntityId, Link};

/// Components evaluated one after another within an entity.
const IMPLICIT_CHAIN: [ComponentKind; 6] = [
    ComponentKind::CopyOnWrite,
    ComponentKind::Animation,
    ComponentKind::Parameters,
    ComponentKind::Transform,
    ComponentKind::Pose,
    ComponentKind::Geometry,
];

/// Components hanging off the end of the implicit chain.
const CHAIN_DEPENDENTS: [ComponentKind; 4] = [
    ComponentKind::Particles,
    ComponentKind::PointCache,
    ComponentKind::Collection,
    ComponentKind::NodeTree,
];

/// Component of another entity that stands for "everything about it".
const OUTPUT_PRIORITY: [ComponentKind; 5] = [
    ComponentKind::Geometry,
    ComponentKind::Pose,
    ComponentKind::Transform,
    ComponentKind::Collection,
    ComponentKind::Parameters,
];

struct RelationBuilder<'a> {
    graph: &'a mut Graph,
    entity: &'a Entity,
    contains: &'a dyn Fn(EntityId) -> bool,
    diagnostics: &'a mut Vec<Diagnostic>,
}

impl RelationBuilder<'_> {
    fn relate(
        &mut self,
        from: OperationId,
        to: OperationId,
        kind: RelationKind,
        name: impl Into<Cow<'static, str>>,
    ) {
        self.graph
            .add_relation(from, to, kind, name, Some(self.entity.id));
    }

    fn own_component(&self, kind: ComponentKind) -> Option<(OperationId, OperationId)> {
        self.graph
            .find_component(self.entity.id, kind)
            .map(|component| (component.entry(), component.exit()))
    }

    fn own_operation(&self, kind: ComponentKind, code: &OperationCode) -> Option<OperationId> {
        self.graph.find_operation(self.entity.id, kind, code)
    }

    fn missing_reference(&mut self, target: EntityId, context: &'static str) {
        let diagnostic = Diagnostic::MissingReference {
            entity: self.entity.name.clone(),
            target,
            context,
        };
        warn!("{diagnostic}");
        self.diagnostics.push(diagnostic);
    }

    fn missing_component(&mut self, target: EntityId, component: ComponentKind, context: &'static str) {
        let target = self
            .graph
            .find_id_node(target)
            .map_or_else(|| target.to_string(), |node| node.name().to_string());
        let diagnostic = Diagnostic::MissingComponent {
            entity: self.entity.name.clone(),
            target,
            component,
            context,
        };
        warn!("{diagnostic}");
        self.diagnostics.push(diagnostic);
    }

    /// Exit operation of a linked component, or a diagnostic.
    fn resolve(&mut self, link: Link, context: &'static str) -> Option<OperationId> {
        if !(self.contains)(link.entity) || !self.graph.contains_entity(link.entity) {
            self.missing_reference(link.entity, context);
            return None;
        }
        match self.graph.find_component(link.entity, link.component) {
            Some(component) => Some(component.exit()),
            None => {
                self.missing_component(link.entity, link.component, context);
                None
            }
        }
    }

    /// Exit of the most downstream component of another entity.
    fn resolve_output(&mut self, target: EntityId, context: &'static str) -> Option<OperationId> {
        if !(self.contains)(target) || !self.graph.contains_entity(target) {
            self.missing_reference(target, context);
            return None;
        }
        OUTPUT_PRIORITY
            .iter()
            .find_map(|kind| self.graph.find_component(target, *kind))
            .map(ComponentNode::exit)
    }

    fn link_into(&mut self, link: Link, to: Option<OperationId>, context: &'static str) {
        let Some(to) = to else {
            return;
        };
        if let Some(from) = self.resolve(link, context) {
            self.relate(from, to, RelationKind::Data, context);
        }
    }

    fn internal(&mut self) {
        let components: Vec<(ComponentKind, OperationId, OperationId, Vec<OperationId>)> = self
            .graph
            .find_id_node(self.entity.id)
            .map(|node| {
                node.components()
                    .filter_map(|(_, id)| self.graph.component(id))
                    .map(|c| (c.kind(), c.entry(), c.exit(), c.operations().to_vec()))
                    .collect()
            })
            .unwrap_or_default();

        for (kind, entry, exit, operations) in components {
            match kind {
                ComponentKind::Parameters => self.wire_parameters(entry, exit, &operations),
                ComponentKind::Pose => self.wire_pose(entry, exit, &operations),
                kind if kind.is_chain() => {
                    let mut prev = entry;
                    for op in operations {
                        self.relate(prev, op, RelationKind::Operation, "Component chain");
                        prev = op;
                    }
                    self.relate(prev, exit, RelationKind::Operation, "Component chain");
                }
                _ => {
                    if operations.is_empty() {
                        self.relate(entry, exit, RelationKind::Operation, "Component chain");
                    }
                    for op in operations {
                        self.relate(entry, op, RelationKind::Operation, "Component entry");
                        self.relate(op, exit, RelationKind::Operation, "Component exit");
                    }
                }
            }
        }
    }

    /// `entry -> ParametersEval -> each driver -> exit`
    fn wire_parameters(&mut self, entry: OperationId, exit: OperationId, operations: &[OperationId]) {
        let Some((eval, drivers)) = operations.split_first() else {
            self.relate(entry, exit, RelationKind::Operation, "Component chain");
            return;
        };
        self.relate(entry, *eval, RelationKind::Operation, "Component entry");
        if drivers.is_empty() {
            self.relate(*eval, exit, RelationKind::Operation, "Component exit");
        }
        for driver in drivers {
            self.relate(*eval, *driver, RelationKind::Operation, "Parameters to driver");
            self.relate(*driver, exit, RelationKind::Operation, "Component exit");
        }
    }

    /// Bones follow their parents; all of them run between init and done.
    fn wire_pose(&mut self, entry: OperationId, exit: OperationId, operations: &[OperationId]) {
        let (Some(init), Some(done)) = (operations.first(), operations.last()) else {
            self.relate(entry, exit, RelationKind::Operation, "Component chain");
            return;
        };
        self.relate(entry, *init, RelationKind::Operation, "Component entry");
        self.relate(*done, exit, RelationKind::Operation, "Component exit");

        if operations.len() <= 2 {
            self.relate(*init, *done, RelationKind::Operation, "Pose init to done");
        }
        for bone in &self.entity.bones {
            let Some(op) = self.own_operation(ComponentKind::Pose, &OperationCode::Bone(bone.name.clone())) else {
                continue;
            };
            let parent = bone.parent.as_ref().and_then(|parent| {
                self.own_operation(ComponentKind::Pose, &OperationCode::Bone(parent.clone()))
            });
            match parent {
                Some(parent) => self.relate(parent, op, RelationKind::Data, "Bone parent"),
                None => self.relate(*init, op, RelationKind::Operation, "Pose init"),
            }
            self.relate(op, *done, RelationKind::Operation, "Pose done");
        }
    }

    fn implicit(&mut self) {
        let mut tail: Option<OperationId> = None;
        for kind in IMPLICIT_CHAIN {
            let Some((entry, exit)) = self.own_component(kind) else {
                continue;
            };
            if let Some(prev) = tail {
                self.relate(prev, entry, RelationKind::Operation, "Implicit");
            }
            tail = Some(exit);
        }
        let Some(tail) = tail else {
            return;
        };
        for kind in CHAIN_DEPENDENTS {
            if let Some((entry, _)) = self.own_component(kind) {
                self.relate(tail, entry, RelationKind::Operation, "Implicit");
            }
        }
    }

    fn structural(&mut self) {
        let entity = self.entity;

        if let Some(parent) = entity.parent {
            let to = self.own_operation(ComponentKind::Transform, &OperationCode::TransformParent);
            self.link_into(Link::transform(parent), to, "Object Parent");
        }

        if let Some(data) = entity.data {
            let to = self.own_component(ComponentKind::Geometry).map(|(entry, _)| entry);
            self.link_into(Link::geometry(data), to, "Object Data");
        }

        for modifier in &entity.modifiers {
            let to = self.own_operation(
                ComponentKind::Geometry,
                &OperationCode::Modifier(modifier.name.clone()),
            );
            for link in &modifier.targets {
                self.link_into(*link, to, "Modifier");
            }
        }

        let constraints = self.own_operation(ComponentKind::Transform, &OperationCode::TransformConstraints);
        for constraint in &entity.constraints {
            for link in &constraint.targets {
                self.link_into(*link, constraints, "Constraint");
            }
        }

        for input in &entity.node_inputs {
            let to = self.own_operation(ComponentKind::NodeTree, &OperationCode::NodeTreeEval);
            self.link_into(input.source, to, "Node input");
        }

        if let Some(collection) = entity.physics.as_ref().and_then(|physics| physics.effector_collection) {
            let to = self.own_operation(ComponentKind::PointCache, &OperationCode::SimulationStep);
            self.link_into(
                Link::new(collection, ComponentKind::Collection),
                to,
                "Effector collection",
            );
        }

        if let Some(to) = self.own_operation(ComponentKind::Collection, &OperationCode::CollectionEval) {
            for member in &entity.members {
                if let Some(from) = self.resolve_output(*member, "Collection member") {
                    self.relate(from, to, RelationKind::Data, "Collection member");
                }
            }
        }
    }

    fn drivers(&mut self) {
        let entity = self.entity;
        let sync = self.own_operation(ComponentKind::Synchronization, &OperationCode::SyncToOriginal);

        for driver in &entity.drivers {
            let Some(op) = self.own_operation(
                ComponentKind::Parameters,
                &OperationCode::Driver(driver.property.clone()),
            ) else {
                continue;
            };

            for variable in &driver.variables {
                self.link_into(*variable, Some(op), "Driver variable");
            }

            // The driven property is written into the owner's component.
            match self.own_component(driver.component) {
                Some((entry, _)) if driver.component != ComponentKind::Parameters => {
                    self.relate(op, entry, RelationKind::Data, "Driver write");
                }
                Some(_) => {}
                None => self.missing_component(entity.id, driver.component, "Driver write"),
            }

            if driver.flush_to_original {
                if let Some(sync) = sync {
                    self.relate(op, sync, RelationKind::CowSync, "Flush to original");
                    if let Some(node) = self.graph.operation_mut(sync) {
                        if !node.sync_properties.contains(&driver.property) {
                            node.sync_properties.push(driver.property.clone());
                        }
                    }
                }
            }
        }
    }

    fn time(&mut self) {
        let time_source = self.graph.time_source();
        let graph = &*self.graph;
        let ops: Vec<OperationId> = graph
            .find_id_node(self.entity.id)
            .into_iter()
            .flat_map(|node| node.components())
            .filter_map(|(_, component)| graph.component(component))
            .flat_map(|component| component.operations().iter().copied())
            .filter(|op| graph.operation(*op).is_some_and(|node| node.is_time_dependent()))
            .collect();
        for op in ops {
            self.relate(time_source, op, RelationKind::Time, "Time Source");
        }
    }
}

/// Phase 2 for one entity.
///
/// `contains` tells whether an entity belongs to the working set.
pub(crate) fn build_entity_relations(
    graph: &mut Graph,
    entity: &Entity,
    contains: &dyn Fn(EntityId) -> bool,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if !graph.contains_entity(entity.id) {
        return;
    }
    let mut builder = RelationBuilder {
        graph,
        entity,
        contains,
        diagnostics,
    };
    builder.internal();
    builder.implicit();
    builder.structural();
    builder.drivers();
    builder.time();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::nodes::build_entity_nodes;
    use crate::eval::NoopBinder;
    use crate::scene::{Driver, Scene};

    fn build(scene: &Scene) -> (Graph, Vec<Diagnostic>) {
        let mut graph = Graph::new();
        for entity in scene.entities() {
            build_entity_nodes(&mut graph, &NoopBinder, entity);
        }
        let mut diagnostics = Vec::new();
        let contains = |id: EntityId| scene.contains(id);
        for entity in scene.entities() {
            build_entity_relations(&mut graph, entity, &contains, &mut diagnostics);
        }
        (graph, diagnostics)
    }

    fn exit(graph: &Graph, entity: EntityId, kind: ComponentKind) -> OperationId {
        graph
            .find_operation(entity, kind, &OperationCode::Exit)
            .expect("component exists")
    }

    fn entry(graph: &Graph, entity: EntityId, kind: ComponentKind) -> OperationId {
        graph
            .find_operation(entity, kind, &OperationCode::Entry)
            .expect("component exists")
    }

    #[test]
    fn geometry_follows_transform() {
        let mut scene = Scene::new();
        let mesh = scene.add(Entity::mesh("MeshData"));
        let cube = scene.add(Entity::object("Cube").with_data(mesh));
        let (graph, diagnostics) = build(&scene);

        assert!(diagnostics.is_empty());
        assert!(graph.reaches(
            exit(&graph, cube, ComponentKind::Transform),
            entry(&graph, cube, ComponentKind::Geometry)
        ));
        assert!(graph.reaches(
            exit(&graph, mesh, ComponentKind::Geometry),
            exit(&graph, cube, ComponentKind::Geometry)
        ));
    }

    #[test]
    fn parent_links_transforms() {
        let mut scene = Scene::new();
        let parent = scene.add(Entity::object("Parent"));
        let child = scene.add(Entity::object("Child").with_parent(parent));
        let (graph, _) = build(&scene);

        let parent_op = graph
            .find_operation(child, ComponentKind::Transform, &OperationCode::TransformParent)
            .expect("parent operation exists");
        assert!(graph
            .relations()
            .has_relation(exit(&graph, parent, ComponentKind::Transform), parent_op));
        let relation = graph
            .relations()
            .active()
            .find(|r| r.to() == parent_op && r.kind() == RelationKind::Data)
            .expect("parent relation exists");
        assert_eq!(relation.owner(), Some(child));
    }

    #[test]
    fn dangling_reference_is_skipped() {
        let mut scene = Scene::new();
        let target = scene.add(Entity::object("Target"));
        let cube = scene.add(Entity::object("Cube").with_modifier("Curve", vec![Link::geometry(target)]));
        scene.remove(target);
        let (graph, diagnostics) = build(&scene);

        assert!(matches!(
            diagnostics.as_slice(),
            [Diagnostic::MissingReference { context: "Modifier", .. }]
        ));
        assert!(graph.find_component(cube, ComponentKind::Geometry).is_some());
    }

    #[test]
    fn missing_component_is_reported() {
        let mut scene = Scene::new();
        let empty = scene.add(Entity::object("Empty"));
        scene.add(Entity::object("Cube").with_modifier("Curve", vec![Link::geometry(empty)]));
        let (_, diagnostics) = build(&scene);

        assert!(matches!(
            diagnostics.as_slice(),
            [Diagnostic::MissingComponent { component: ComponentKind::Geometry, .. }]
        ));
    }

    #[test]
    fn driver_relations() {
        let mut scene = Scene::new();
        let source = scene.add(Entity::object("Source"));
        let driven = scene.add(
            Entity::object("Driven").with_driver(
                Driver::new("location", ComponentKind::Transform)
                    .reading(Link::transform(source))
                    .with_time()
                    .flushing_to_original(),
            ),
        );
        let (graph, diagnostics) = build(&scene);
        assert!(diagnostics.is_empty());

        let driver = graph
            .find_operation(driven, ComponentKind::Parameters, &OperationCode::Driver("location".into()))
            .expect("driver exists");
        let sync = graph
            .find_operation(driven, ComponentKind::Synchronization, &OperationCode::SyncToOriginal)
            .expect("sync exists");

        assert!(graph
            .relations()
            .has_relation(exit(&graph, source, ComponentKind::Transform), driver));
        assert!(graph
            .relations()
            .has_relation(driver, entry(&graph, driven, ComponentKind::Transform)));
        assert!(graph.relations().has_relation(graph.time_source(), driver));
        assert!(graph
            .relations()
            .active()
            .any(|r| r.from() == driver && r.to() == sync && r.kind() == RelationKind::CowSync));
        assert_eq!(
            graph.operation(sync).map(|op| op.sync_properties().to_vec()),
            Some(vec!["location".to_string()])
        );
    }

    #[test]
    fn repeated_drivers_order_every_input() {
        let mut scene = Scene::new();
        let a = scene.add(Entity::object("A"));
        let b = scene.add(Entity::object("B"));
        let driven = scene.add(
            Entity::object("Driven")
                .with_driver(Driver::new("x", ComponentKind::Transform).reading(Link::transform(a)))
                .with_driver(Driver::new("x", ComponentKind::Transform).reading(Link::transform(b))),
        );
        let (graph, diagnostics) = build(&scene);
        assert!(diagnostics.is_empty());

        let driver = graph
            .find_operation(driven, ComponentKind::Parameters, &OperationCode::Driver("x".into()))
            .expect("driver exists");
        assert!(graph.reaches(exit(&graph, a, ComponentKind::Transform), driver));
        assert!(graph.reaches(exit(&graph, b, ComponentKind::Transform), driver));
    }

    #[test]
    fn time_relations_stay_on_their_entity() {
        let mut scene = Scene::new();
        let still = scene.add(Entity::object("Still"));
        let moving = scene.add(Entity::object("Moving").animated());
        let (graph, _) = build(&scene);

        let animation = graph
            .find_operation(moving, ComponentKind::Animation, &OperationCode::AnimationEval)
            .expect("animation exists");
        let targets: Vec<OperationId> = graph
            .relations()
            .active()
            .filter(|r| r.kind() == RelationKind::Time)
            .map(|r| r.to())
            .collect();
        assert_eq!(targets, vec![animation]);
        assert!(graph.find_component(still, ComponentKind::Animation).is_none());
    }

    #[test]
    fn bones_follow_parents() {
        let mut scene = Scene::new();
        let rig = scene.add(
            Entity::armature("Rig")
                .with_bone("root", None)
                .with_bone("spine", Some("root"))
                .with_bone("head", Some("spine")),
        );
        let (graph, _) = build(&scene);
        let bone = |name: &str| {
            graph
                .find_operation(rig, ComponentKind::Pose, &OperationCode::Bone(name.into()))
                .expect("bone exists")
        };

        assert!(graph.relations().has_relation(bone("root"), bone("spine")));
        assert!(graph.reaches(bone("root"), bone("head")));
        assert!(!graph.reaches(bone("head"), bone("root")));
    }
}
