//! Evaluated Copies
//!
//! Evaluation never writes into the original scene. Each pass works on its
//! own copy-on-write set of entity copies ([`PassCopies`]): the first write to
//! an entity clones it from the last committed evaluated copy (or from the
//! original if there is none), and every later write in the same pass
//! mutates that clone in place.
//!
//! When a pass completes, its working copies replace the committed ones in
//! the [`EvaluatedStore`] in one step. An aborted pass simply drops them, so
//! consumers keep seeing the last complete state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::scene::{EntityId, Properties, Scene, Value};

/// Derived state of one entity as of the last completed pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluatedCopy {
    entity: EntityId,
    /// Pass counter at commit time; `0` for an unevaluated original.
    generation: u64,
    properties: Properties,
}

impl EvaluatedCopy {
    pub(crate) fn new(entity: EntityId, generation: u64, properties: Properties) -> Self {
        Self {
            entity,
            generation,
            properties,
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.properties.get(property)
    }

    pub fn get_float(&self, property: &str) -> Option<f64> {
        self.get(property).and_then(Value::as_float)
    }
}

/// Committed evaluated copies, readable while a pass is running.
#[derive(Debug, Default)]
pub struct EvaluatedStore {
    copies: DashMap<EntityId, Arc<EvaluatedCopy>>,
    generation: AtomicU64,
}

impl EvaluatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity: EntityId) -> Option<Arc<EvaluatedCopy>> {
        self.copies.get(&entity).map(|copy| Arc::clone(copy.value()))
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.copies.contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.copies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Publish the working copies of a completed pass.
    pub(crate) fn commit(&self, working: Vec<(EntityId, Properties)>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        for (entity, properties) in working {
            self.copies.insert(
                entity,
                Arc::new(EvaluatedCopy::new(entity, generation, properties)),
            );
        }
        generation
    }

    /// Drop copies of entities that left the graph.
    pub(crate) fn retain(&self, keep: impl Fn(EntityId) -> bool) {
        self.copies.retain(|entity, _| keep(*entity));
    }
}

/// A driven value to mirror into the original entity.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OriginalWrite {
    pub entity: EntityId,
    pub property: String,
    pub value: Value,
}

/// Copy-on-write working set of a single pass.
pub(crate) struct PassCopies<'a> {
    scene: &'a Scene,
    store: &'a EvaluatedStore,
    working: DashMap<EntityId, Arc<RwLock<Properties>>>,
    original_writes: Mutex<Vec<OriginalWrite>>,
}

impl<'a> PassCopies<'a> {
    pub fn new(scene: &'a Scene, store: &'a EvaluatedStore) -> Self {
        Self {
            scene,
            store,
            working: DashMap::new(),
            original_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn scene(&self) -> &'a Scene {
        self.scene
    }

    fn original_properties(&self, entity: EntityId) -> Properties {
        self.scene
            .get(entity)
            .map(|entity| entity.properties.clone())
            .unwrap_or_default()
    }

    /// Replace the working copy with a fresh clone of the original.
    pub fn refresh_from_original(&self, entity: EntityId) {
        let fresh = self.original_properties(entity);
        let existing = self.working.get(&entity).map(|copy| Arc::clone(copy.value()));
        match existing {
            Some(copy) => *copy.write() = fresh,
            None => {
                self.working.insert(entity, Arc::new(RwLock::new(fresh)));
            }
        }
    }

    /// The working copy of an entity, cloned on first touch.
    pub fn working(&self, entity: EntityId) -> Arc<RwLock<Properties>> {
        if let Some(copy) = self.working.get(&entity) {
            return Arc::clone(copy.value());
        }
        let base = match self.store.get(entity) {
            Some(committed) => committed.properties().clone(),
            None => self.original_properties(entity),
        };
        let copy = self
            .working
            .entry(entity)
            .or_insert_with(|| Arc::new(RwLock::new(base)));
        Arc::clone(copy.value())
    }

    /// Read without cloning anything.
    pub fn read(&self, entity: EntityId, property: &str) -> Option<Value> {
        let working = self.working.get(&entity).map(|copy| Arc::clone(copy.value()));
        if let Some(copy) = working {
            return copy.read().get(property).cloned();
        }
        if let Some(committed) = self.store.get(entity) {
            return committed.get(property).cloned();
        }
        self.scene
            .get(entity)
            .and_then(|entity| entity.properties.get(property).cloned())
    }

    pub fn queue_original_write(&self, entity: EntityId, property: String, value: Value) {
        self.original_writes.lock().push(OriginalWrite {
            entity,
            property,
            value,
        });
    }

    /// Working copies sorted by entity, plus queued write-backs.
    pub fn into_parts(self) -> (Vec<(EntityId, Properties)>, Vec<OriginalWrite>) {
        let mut working: Vec<(EntityId, Properties)> = self
            .working
            .into_iter()
            .map(|(entity, copy)| (entity, copy.read().clone()))
            .collect();
        working.sort_by_key(|(entity, _)| *entity);
        (working, self.original_writes.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Entity;

    fn scene() -> (Scene, EntityId) {
        let mut scene = Scene::new();
        let id = scene.add(Entity::object("Cube").with_property("x", 1.0));
        (scene, id)
    }

    #[test]
    fn first_touch_clones_original() {
        let (scene, id) = scene();
        let store = EvaluatedStore::new();
        let copies = PassCopies::new(&scene, &store);

        copies.working(id).write().insert("x".into(), Value::Float(5.0));
        assert_eq!(copies.read(id, "x"), Some(Value::Float(5.0)));
        assert_eq!(
            scene.get(id).and_then(|e| e.properties.get("x").cloned()),
            Some(Value::Float(1.0))
        );
    }

    #[test]
    fn refinement_starts_from_committed_copy() {
        let (scene, id) = scene();
        let store = EvaluatedStore::new();
        let mut props = Properties::new();
        props.insert("x".into(), Value::Float(3.0));
        props.insert("y".into(), Value::Float(9.0));
        store.commit(vec![(id, props)]);

        let copies = PassCopies::new(&scene, &store);
        let working = copies.working(id);
        assert_eq!(working.read().get("y"), Some(&Value::Float(9.0)));

        copies.refresh_from_original(id);
        assert_eq!(copies.read(id, "y"), None);
        assert_eq!(copies.read(id, "x"), Some(Value::Float(1.0)));
    }

    #[test]
    fn commit_publishes_new_generation() {
        let (scene, id) = scene();
        let store = EvaluatedStore::new();
        let copies = PassCopies::new(&scene, &store);
        copies.working(id).write().insert("x".into(), Value::Float(2.0));
        copies.queue_original_write(id, "x".into(), Value::Float(2.0));

        let (working, writes) = copies.into_parts();
        assert_eq!(writes.len(), 1);
        let generation = store.commit(working);

        let committed = store.get(id).expect("committed copy");
        assert_eq!(committed.generation(), generation);
        assert_eq!(committed.get_float("x"), Some(2.0));
    }

    #[test]
    fn dropped_pass_leaves_store_untouched() {
        let (scene, id) = scene();
        let store = EvaluatedStore::new();
        {
            let copies = PassCopies::new(&scene, &store);
            copies.working(id).write().insert("x".into(), Value::Float(7.0));
        }
        assert!(store.get(id).is_none());
        assert_eq!(store.generation(), 0);
    }
}
