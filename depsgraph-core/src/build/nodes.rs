//! Phase 1: nodes.
//!
//! Creates the ID-node, components and operations of an entity. No relation
//! is created here; relations may point at any entity of the working set,
//! so they wait until every node exists.

use indexmap::map::Entry;
use indexmap::IndexMap;
use tracing::debug;

use crate::eval::{OperationBinder, OperationKey};
use crate::graph::{ComponentId, ComponentKind, Graph, OperationCode, OperationId};
use crate::scene::{Entity, EntityKind};

struct NodeBuilder<'a> {
    graph: &'a mut Graph,
    binder: &'a dyn OperationBinder,
    entity: &'a Entity,
}

impl NodeBuilder<'_> {
    fn component(&mut self, kind: ComponentKind) -> Option<ComponentId> {
        let id_node = self.graph.find_id_node(self.entity.id)?.id();
        self.graph.add_component(id_node, kind)
    }

    fn operation(
        &mut self,
        component: ComponentId,
        kind: ComponentKind,
        code: OperationCode,
        time_dependent: bool,
    ) -> Option<OperationId> {
        let key = OperationKey {
            entity: self.entity.id,
            component: kind,
            code: code.clone(),
        };
        let callable = self.binder.bind(&key);
        let op = self.graph.add_operation(component, code, callable)?;
        if let Some(node) = self.graph.operation_mut(op) {
            node.time_dependent = time_dependent;
        }
        Some(op)
    }

    /// Add a component with the given operations.
    ///
    /// Repeated codes collapse into one operation, time dependent if any of
    /// them is, so every relation built for the code lands on the same node.
    fn add(&mut self, kind: ComponentKind, operations: Vec<(OperationCode, bool)>) {
        let Some(component) = self.component(kind) else {
            return;
        };
        let mut merged: IndexMap<OperationCode, bool> = IndexMap::with_capacity(operations.len());
        for (code, time_dependent) in operations {
            match merged.entry(code) {
                Entry::Occupied(mut existing) => {
                    debug!(entity = %self.entity.name, code = %existing.key(), "duplicate operation merged");
                    *existing.get_mut() |= time_dependent;
                }
                Entry::Vacant(slot) => {
                    slot.insert(time_dependent);
                }
            }
        }
        for (code, time_dependent) in merged {
            self.operation(component, kind, code, time_dependent);
        }
    }
}

/// Phase 1 for one entity.
pub(crate) fn build_entity_nodes(graph: &mut Graph, binder: &dyn OperationBinder, entity: &Entity) {
    graph.add_id_node(entity.id, &entity.name, entity.kind);
    let mut builder = NodeBuilder {
        graph,
        binder,
        entity,
    };

    builder.add(
        ComponentKind::CopyOnWrite,
        vec![(OperationCode::CopyOnWrite, false)],
    );

    if entity.animated {
        builder.add(
            ComponentKind::Animation,
            vec![(OperationCode::AnimationEval, true)],
        );
    }

    let mut parameters = vec![(OperationCode::ParametersEval, false)];
    parameters.extend(
        entity
            .drivers
            .iter()
            .map(|driver| (OperationCode::Driver(driver.property.clone()), driver.uses_time)),
    );
    builder.add(ComponentKind::Parameters, parameters);

    if entity.kind.has_transform() {
        let mut transform = vec![(OperationCode::TransformLocal, false)];
        if entity.parent.is_some() {
            transform.push((OperationCode::TransformParent, false));
        }
        if !entity.constraints.is_empty() {
            transform.push((OperationCode::TransformConstraints, false));
        }
        transform.push((OperationCode::TransformFinal, false));
        builder.add(ComponentKind::Transform, transform);
    }

    if entity.kind == EntityKind::Armature && !entity.bones.is_empty() {
        let mut pose = vec![(OperationCode::PoseInit, false)];
        pose.extend(
            entity
                .bones
                .iter()
                .map(|bone| (OperationCode::Bone(bone.name.clone()), false)),
        );
        pose.push((OperationCode::PoseDone, false));
        builder.add(ComponentKind::Pose, pose);
    }

    if entity.has_geometry() {
        let mut geometry: Vec<(OperationCode, bool)> = entity
            .modifiers
            .iter()
            .map(|modifier| (OperationCode::Modifier(modifier.name.clone()), false))
            .collect();
        geometry.push((OperationCode::GeometryEval, false));
        builder.add(ComponentKind::Geometry, geometry);
    }

    if !entity.particle_systems.is_empty() {
        builder.add(
            ComponentKind::Particles,
            entity
                .particle_systems
                .iter()
                .map(|name| (OperationCode::ParticleSystem(name.clone()), true))
                .collect(),
        );
    }

    if entity.physics.is_some() {
        builder.add(
            ComponentKind::PointCache,
            vec![
                (OperationCode::PointCacheReset, false),
                (OperationCode::SimulationStep, true),
            ],
        );
    }

    match entity.kind {
        EntityKind::Collection => {
            builder.add(
                ComponentKind::Collection,
                vec![(OperationCode::CollectionEval, false)],
            );
        }
        EntityKind::NodeTree => {
            builder.add(
                ComponentKind::NodeTree,
                vec![(OperationCode::NodeTreeEval, false)],
            );
        }
        _ => {}
    }

    if entity.drivers.iter().any(|driver| driver.flush_to_original) {
        builder.add(
            ComponentKind::Synchronization,
            vec![(OperationCode::SyncToOriginal, false)],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{NoopBinder, OperationFn};
    use crate::scene::{Driver, Physics, Scene};

    fn components(graph: &Graph, entity: &Entity) -> Vec<ComponentKind> {
        graph
            .find_id_node(entity.id)
            .map(|node| node.components().map(|(kind, _)| kind).collect())
            .unwrap_or_default()
    }

    #[test]
    fn plain_object_layout() {
        let mut scene = Scene::new();
        let id = scene.add(Entity::object("Empty"));
        let mut graph = Graph::new();
        let entity = scene.get(id).expect("entity exists");
        build_entity_nodes(&mut graph, &NoopBinder, entity);

        assert_eq!(
            components(&graph, entity),
            vec![
                ComponentKind::CopyOnWrite,
                ComponentKind::Parameters,
                ComponentKind::Transform
            ]
        );
        let transform = graph
            .find_component(id, ComponentKind::Transform)
            .expect("transform exists");
        assert_eq!(transform.operations().len(), 2);
    }

    #[test]
    fn full_layout() {
        let mut scene = Scene::new();
        let target = scene.add(Entity::object("Target"));
        let id = scene.add(
            Entity::object("Busy")
                .with_parent(target)
                .with_constraint("Track", vec![])
                .with_modifier("Subsurf", vec![])
                .with_driver(Driver::new("x", ComponentKind::Transform).with_time().flushing_to_original())
                .with_particles("Sparks")
                .with_physics(Physics::default())
                .animated(),
        );
        let mut graph = Graph::new();
        let entity = scene.get(id).expect("entity exists");
        build_entity_nodes(&mut graph, &NoopBinder, entity);

        assert_eq!(components(&graph, entity).len(), 8);
        let time_dependent: Vec<String> = graph
            .operations()
            .filter(|op| op.is_time_dependent())
            .map(|op| op.code().to_string())
            .collect();
        assert_eq!(
            time_dependent,
            vec!["AnimationEval", "Driver[x]", "ParticleSystem[Sparks]", "SimulationStep"]
        );
        let transform = graph
            .find_component(id, ComponentKind::Transform)
            .expect("transform exists");
        assert_eq!(transform.operations().len(), 4);
    }

    #[test]
    fn binder_sees_every_inner_operation() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mut scene = Scene::new();
        let id = scene.add(Entity::mesh("Mesh").with_modifier("Bevel", vec![]));
        let seen = AtomicUsize::new(0);
        let binder = |_key: &OperationKey| -> Option<OperationFn> {
            seen.fetch_add(1, Ordering::SeqCst);
            None
        };
        let mut graph = Graph::new();
        build_entity_nodes(&mut graph, &binder, scene.get(id).expect("entity exists"));

        // CopyOnWrite, ParametersEval, Modifier[Bevel], GeometryEval
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn repeated_drivers_share_one_operation() {
        let mut scene = Scene::new();
        let id = scene.add(
            Entity::object("Twice")
                .with_driver(Driver::new("x", ComponentKind::Transform))
                .with_driver(Driver::new("x", ComponentKind::Transform).with_time()),
        );
        let mut graph = Graph::new();
        build_entity_nodes(&mut graph, &NoopBinder, scene.get(id).expect("entity exists"));

        let parameters = graph
            .find_component(id, ComponentKind::Parameters)
            .expect("parameters exist");
        // ParametersEval and a single Driver[x]
        assert_eq!(parameters.operations().len(), 2);
        let driver = graph
            .find_operation(id, ComponentKind::Parameters, &OperationCode::Driver("x".into()))
            .and_then(|op| graph.operation(op))
            .expect("driver exists");
        assert!(driver.is_time_dependent());
    }
}
