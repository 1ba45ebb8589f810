//! Evaluation Context
//!
//! Operations are opaque callables bound at build time. The core only knows
//! when to call them; what they compute is up to the binder. Every call
//! receives an [`EvalContext`] carrying the current frame and access to the
//! evaluated copies of the pass, so no operation needs ambient global state.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::copies::PassCopies;
use crate::error::OperationError;
use crate::graph::{ComponentKind, OperationCode};
use crate::scene::{Entity, EntityId, Value};

/// The computation behind an operation-node.
pub type OperationFn = Arc<dyn Fn(&EvalContext<'_>) -> Result<(), OperationError> + Send + Sync>;

/// Wrap a closure as an [`OperationFn`].
pub fn operation<F>(f: F) -> OperationFn
where
    F: Fn(&EvalContext<'_>) -> Result<(), OperationError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Scene time at which a pass evaluates.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct FrameTime(f64);

impl FrameTime {
    pub fn new(frame: f64) -> Self {
        Self(frame)
    }

    pub fn frame(&self) -> f64 {
        self.0
    }
}

impl From<f64> for FrameTime {
    fn from(frame: f64) -> Self {
        Self(frame)
    }
}

impl From<i32> for FrameTime {
    fn from(frame: i32) -> Self {
        Self(f64::from(frame))
    }
}

impl fmt::Display for FrameTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies an operation to a binder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub entity: EntityId,
    pub component: ComponentKind,
    pub code: OperationCode,
}

/// Supplies callables for operations while the graph is built.
///
/// Returning `None` leaves the operation without a computation; it still
/// takes part in ordering and tagging.
pub trait OperationBinder: Send + Sync {
    fn bind(&self, key: &OperationKey) -> Option<OperationFn>;
}

impl<F> OperationBinder for F
where
    F: Fn(&OperationKey) -> Option<OperationFn> + Send + Sync,
{
    fn bind(&self, key: &OperationKey) -> Option<OperationFn> {
        self(key)
    }
}

/// Binds nothing. Useful for structural work such as graph export.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBinder;

impl OperationBinder for NoopBinder {
    fn bind(&self, _key: &OperationKey) -> Option<OperationFn> {
        None
    }
}

/// What a running operation can see and touch.
///
/// Reads resolve against the working copies of the current pass first, then
/// the last committed evaluated copy, then the original entity. Writes only
/// ever go to the working copy of the operation's own entity.
pub struct EvalContext<'a> {
    time: FrameTime,
    key: OperationKey,
    copies: &'a PassCopies<'a>,
}

impl<'a> EvalContext<'a> {
    pub(crate) fn new(time: FrameTime, key: OperationKey, copies: &'a PassCopies<'a>) -> Self {
        Self { time, key, copies }
    }

    pub fn frame(&self) -> FrameTime {
        self.time
    }

    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    pub fn entity(&self) -> EntityId {
        self.key.entity
    }

    pub fn component(&self) -> ComponentKind {
        self.key.component
    }

    pub fn operation(&self) -> &OperationCode {
        &self.key.code
    }

    /// The original (un-evaluated) entity.
    pub fn original(&self, entity: EntityId) -> Option<&'a Entity> {
        self.copies.scene().get(entity)
    }

    /// Current value of a property of any entity.
    pub fn read(&self, entity: EntityId, property: &str) -> Option<Value> {
        self.copies.read(entity, property)
    }

    /// Numeric property of any entity, or a [`OperationError::MissingInput`].
    pub fn read_float(&self, entity: EntityId, property: &str) -> Result<f64, OperationError> {
        self.read(entity, property)
            .and_then(|value| value.as_float())
            .ok_or_else(|| OperationError::MissingInput {
                entity,
                property: property.to_string(),
            })
    }

    /// Current value of a property of the operation's own entity.
    pub fn get(&self, property: &str) -> Option<Value> {
        self.read(self.key.entity, property)
    }

    /// Write a property of the operation's own evaluated copy.
    pub fn set(&self, property: impl Into<String>, value: impl Into<Value>) {
        let copy = self.copies.working(self.key.entity);
        copy.write().insert(property.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::copies::EvaluatedStore;
    use crate::scene::Scene;

    #[test]
    fn reads_fall_back_to_original() {
        let mut scene = Scene::new();
        let cube = scene.add(crate::scene::Entity::object("Cube").with_property("size", 2.0));
        let store = EvaluatedStore::new();
        let copies = PassCopies::new(&scene, &store);
        let key = OperationKey {
            entity: cube,
            component: ComponentKind::Geometry,
            code: OperationCode::GeometryEval,
        };
        let ctx = EvalContext::new(FrameTime::from(1), key, &copies);

        assert_eq!(ctx.read_float(cube, "size"), Ok(2.0));
        assert!(matches!(
            ctx.read_float(cube, "missing"),
            Err(OperationError::MissingInput { .. })
        ));

        ctx.set("size", 4.0);
        assert_eq!(ctx.get("size"), Some(Value::Float(4.0)));
        // The original is untouched.
        assert_eq!(
            ctx.original(cube).and_then(|e| e.properties.get("size").cloned()),
            Some(Value::Float(2.0))
        );
    }

    #[test]
    fn closures_are_binders() {
        let binder = |key: &OperationKey| -> Option<OperationFn> {
            matches!(key.code, OperationCode::GeometryEval).then(|| operation(|_ctx| Ok(())))
        };
        let key = OperationKey {
            entity: EntityId::new(0),
            component: ComponentKind::Geometry,
            code: OperationCode::GeometryEval,
        };
        assert!(binder.bind(&key).is_some());
        assert!(NoopBinder.bind(&key).is_none());
    }
}
