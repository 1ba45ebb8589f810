//! Scene Description
//!
//! This module defines the input the dependency graph is built from: a set of
//! entities (objects, mesh data-blocks, collections, node trees) and the
//! references between them.
//!
//! # Overview
//!
//! The scene is owned by the editing layer. The graph never stores entity
//! data itself; it keeps a [`SharedScene`] handle so that operations can read
//! original values during evaluation, and so that driven properties can be
//! written back after a pass completes.
//!
//! References are expressed with [`Link`], which names both the target entity
//! and the component of that entity whose result is needed. A modifier that
//! deforms along another object's curve links to that object's `Geometry`;
//! a constraint that copies a location links to its `Transform`.

mod value;

use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::graph::ComponentKind;

pub use value::{Properties, Value};

/// Scene handle shared between the editing layer and the graph.
pub type SharedScene = Arc<RwLock<Scene>>;

/// Identifier of an entity within a [`Scene`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u32);

impl EntityId {
    /// Wrap a raw identifier.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of data-block an entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Object,
    Mesh,
    Armature,
    Collection,
    NodeTree,
    Scene,
}

impl EntityKind {
    /// Whether entities of this kind have a placement in the world.
    pub fn has_transform(self) -> bool {
        matches!(self, EntityKind::Object | EntityKind::Armature)
    }
}

/// A dependency on one component of another entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub entity: EntityId,
    pub component: ComponentKind,
}

impl Link {
    pub fn new(entity: EntityId, component: ComponentKind) -> Self {
        Self { entity, component }
    }

    pub fn transform(entity: EntityId) -> Self {
        Self::new(entity, ComponentKind::Transform)
    }

    pub fn geometry(entity: EntityId) -> Self {
        Self::new(entity, ComponentKind::Geometry)
    }
}

/// A geometry modifier in an object's stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modifier {
    pub name: String,
    pub targets: Vec<Link>,
}

/// A transform constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    pub targets: Vec<Link>,
}

/// A driver computing one property of its owner from other entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    /// Name of the driven property on the owning entity.
    pub property: String,
    /// Component of the owner that consumes the driven property.
    pub component: ComponentKind,
    /// Inputs read by the driver expression.
    pub variables: Vec<Link>,
    /// The expression reads the current frame.
    pub uses_time: bool,
    /// The driven value is mirrored into the original entity.
    pub flush_to_original: bool,
}

impl Driver {
    pub fn new(property: impl Into<String>, component: ComponentKind) -> Self {
        Self {
            property: property.into(),
            component,
            variables: Vec::new(),
            uses_time: false,
            flush_to_original: false,
        }
    }

    pub fn reading(mut self, link: Link) -> Self {
        self.variables.push(link);
        self
    }

    pub fn with_time(mut self) -> Self {
        self.uses_time = true;
        self
    }

    pub fn flushing_to_original(mut self) -> Self {
        self.flush_to_original = true;
        self
    }
}

/// Physics simulation settings with a point cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Physics {
    /// Collection whose members act as force fields or colliders.
    pub effector_collection: Option<EntityId>,
}

/// A bone in an armature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bone {
    pub name: String,
    pub parent: Option<String>,
}

/// An input socket of a node tree fed by another entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInput {
    pub socket: String,
    pub source: Link,
}

/// A scene data-block as the graph sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub kind: EntityKind,
    /// Original (user-edited) property values.
    pub properties: Properties,
    pub parent: Option<EntityId>,
    /// Data-block providing the base geometry of an object.
    pub data: Option<EntityId>,
    pub modifiers: Vec<Modifier>,
    pub constraints: Vec<Constraint>,
    pub drivers: Vec<Driver>,
    /// Has time-based animation data.
    pub animated: bool,
    pub particle_systems: Vec<String>,
    pub physics: Option<Physics>,
    pub bones: Vec<Bone>,
    /// Members of a collection (objects or nested collections).
    pub members: Vec<EntityId>,
    pub node_inputs: Vec<NodeInput>,
}

impl Entity {
    /// Create an empty entity. The ID is assigned by [`Scene::add`].
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(u32::MAX),
            name: name.into(),
            kind,
            properties: Properties::new(),
            parent: None,
            data: None,
            modifiers: Vec::new(),
            constraints: Vec::new(),
            drivers: Vec::new(),
            animated: false,
            particle_systems: Vec::new(),
            physics: None,
            bones: Vec::new(),
            members: Vec::new(),
            node_inputs: Vec::new(),
        }
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Object, name)
    }

    pub fn mesh(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Mesh, name)
    }

    pub fn armature(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Armature, name)
    }

    pub fn collection(name: impl Into<String>) -> Self {
        Self::new(EntityKind::Collection, name)
    }

    pub fn node_tree(name: impl Into<String>) -> Self {
        Self::new(EntityKind::NodeTree, name)
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: EntityId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_data(mut self, data: EntityId) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_modifier(mut self, name: impl Into<String>, targets: Vec<Link>) -> Self {
        self.modifiers.push(Modifier {
            name: name.into(),
            targets,
        });
        self
    }

    pub fn with_constraint(mut self, name: impl Into<String>, targets: Vec<Link>) -> Self {
        self.constraints.push(Constraint {
            name: name.into(),
            targets,
        });
        self
    }

    pub fn with_driver(mut self, driver: Driver) -> Self {
        self.drivers.push(driver);
        self
    }

    pub fn animated(mut self) -> Self {
        self.animated = true;
        self
    }

    pub fn with_particles(mut self, name: impl Into<String>) -> Self {
        self.particle_systems.push(name.into());
        self
    }

    pub fn with_physics(mut self, physics: Physics) -> Self {
        self.physics = Some(physics);
        self
    }

    pub fn with_bone(mut self, name: impl Into<String>, parent: Option<&str>) -> Self {
        self.bones.push(Bone {
            name: name.into(),
            parent: parent.map(str::to_string),
        });
        self
    }

    pub fn with_member(mut self, member: EntityId) -> Self {
        self.members.push(member);
        self
    }

    pub fn with_node_input(mut self, socket: impl Into<String>, source: Link) -> Self {
        self.node_inputs.push(NodeInput {
            socket: socket.into(),
            source,
        });
        self
    }

    /// Whether the entity produces geometry that needs a geometry component.
    pub fn has_geometry(&self) -> bool {
        match self.kind {
            EntityKind::Mesh => true,
            EntityKind::Object | EntityKind::Armature => {
                self.data.is_some() || !self.modifiers.is_empty()
            }
            _ => false,
        }
    }

    /// Every entity this one reads from, in declaration order.
    ///
    /// Driver targets are not included: a driver writes into its owner.
    pub fn references(&self) -> IndexSet<EntityId> {
        let mut refs = IndexSet::new();
        refs.extend(self.parent);
        refs.extend(self.data);
        for modifier in &self.modifiers {
            refs.extend(modifier.targets.iter().map(|link| link.entity));
        }
        for constraint in &self.constraints {
            refs.extend(constraint.targets.iter().map(|link| link.entity));
        }
        for driver in &self.drivers {
            refs.extend(driver.variables.iter().map(|link| link.entity));
        }
        if let Some(physics) = &self.physics {
            refs.extend(physics.effector_collection);
        }
        refs.extend(self.members.iter().copied());
        refs.extend(self.node_inputs.iter().map(|input| input.source.entity));
        refs.shift_remove(&self.id);
        refs
    }
}

/// A named set of collections that is evaluated and rendered together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewLayer {
    pub name: String,
    pub collections: Vec<EntityId>,
}

/// The complete scene description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scene {
    entities: IndexMap<EntityId, Entity>,
    view_layers: Vec<ViewLayer>,
    /// The scene data-block itself, if it takes part in evaluation.
    scene_entity: Option<EntityId>,
    compositor: Option<EntityId>,
    next_id: u32,
}

impl Scene {
    /// Create an empty scene.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the scene in a shared handle.
    pub fn into_shared(self) -> SharedScene {
        Arc::new(RwLock::new(self))
    }

    /// Add an entity, assigning it a fresh ID.
    pub fn add(&mut self, mut entity: Entity) -> EntityId {
        let id = EntityId::new(self.next_id);
        self.next_id += 1;
        entity.id = id;
        self.entities.insert(id, entity);
        id
    }

    /// Remove an entity. References to it elsewhere become dangling.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        self.entities.shift_remove(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Look up an entity by name.
    pub fn find(&self, name: &str) -> Option<EntityId> {
        self.entities
            .values()
            .find(|entity| entity.name == name)
            .map(|entity| entity.id)
    }

    /// All entities in insertion order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Display name of an entity, falling back to its ID.
    pub fn name_of(&self, id: EntityId) -> String {
        self.get(id)
            .map(|entity| entity.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn add_view_layer(&mut self, name: impl Into<String>, collections: Vec<EntityId>) {
        self.view_layers.push(ViewLayer {
            name: name.into(),
            collections,
        });
    }

    pub fn view_layer(&self, name: &str) -> Option<&ViewLayer> {
        self.view_layers.iter().find(|layer| layer.name == name)
    }

    pub fn set_scene_entity(&mut self, id: EntityId) {
        self.scene_entity = Some(id);
    }

    pub fn scene_entity(&self) -> Option<EntityId> {
        self.scene_entity
    }

    pub fn set_compositor(&mut self, id: EntityId) {
        self.compositor = Some(id);
    }

    pub fn compositor(&self) -> Option<EntityId> {
        self.compositor
    }

    /// Entities whose references include `target`.
    pub fn referencing(&self, target: EntityId) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|entity| entity.references().contains(&target))
            .map(|entity| entity.id)
            .collect()
    }

    /// Collection members, recursing into nested collections.
    ///
    /// The collection itself is part of the result. Missing members are
    /// skipped; recursion stops at collections already visited.
    pub fn collection_closure(&self, collection: EntityId) -> IndexSet<EntityId> {
        let mut out = IndexSet::new();
        let mut stack = vec![collection];
        while let Some(id) = stack.pop() {
            let Some(entity) = self.get(id) else {
                continue;
            };
            if !out.insert(id) {
                continue;
            }
            if entity.kind == EntityKind::Collection {
                stack.extend(entity.members.iter().rev().copied());
            }
        }
        out
    }
}
