//! Errors and Diagnostics
//!
//! Nothing recoverable crosses the build or evaluate boundary as an `Err`.
//! Dangling references, broken cycles and failing operations are recorded
//! as [`Diagnostic`]s and the work continues. Only a broken scheduling
//! invariant aborts a pass, and even that is reported as a diagnostic.

use serde::Serialize;
use thiserror::Error;

use crate::graph::{ComponentKind, OperationId, RelationKind};
use crate::scene::EntityId;

/// Error returned by an operation callable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("{0}")]
    Failed(String),

    #[error("missing input {property} on {entity}")]
    MissingInput { entity: EntityId, property: String },

    #[error("panicked: {0}")]
    Panicked(String),
}

impl OperationError {
    pub fn failed(message: impl Into<String>) -> Self {
        OperationError::Failed(message.into())
    }
}

/// A scheduling invariant broke; the pass was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("dependency cycle at schedule time: {remaining} operations never became ready")]
    CycleDetected { remaining: usize },

    #[error("pending dependency count underflow on {operation}")]
    PendingUnderflow { operation: OperationId },

    #[error("operation {operation} panicked: {message}")]
    OperationPanicked { operation: OperationId, message: String },

    #[error("graph is retiring")]
    Retired,
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How serious a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A recoverable condition met while building or evaluating.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Diagnostic {
    /// A relation pointed at an entity that does not exist.
    #[error("{entity}: {context} references missing entity {target}; relation skipped")]
    MissingReference {
        entity: String,
        target: EntityId,
        context: &'static str,
    },

    /// A relation pointed at a component the target does not have.
    #[error("{entity}: {context} needs {component} of {target}, which has none; relation skipped")]
    MissingComponent {
        entity: String,
        target: String,
        component: ComponentKind,
        context: &'static str,
    },

    /// A relation was taken out to break a dependency cycle.
    #[error("dependency cycle: removed {kind} relation '{name}' {from} -> {to}")]
    CycleBroken {
        from: String,
        to: String,
        kind: RelationKind,
        name: String,
    },

    /// An operation returned an error or panicked.
    #[error("{entity}/{component}/{operation} failed: {error}")]
    OperationFailed {
        entity: String,
        component: ComponentKind,
        operation: String,
        error: OperationError,
    },

    /// A pass stopped early; the last committed evaluated state is kept.
    #[error("evaluation pass aborted: {0}")]
    PassAborted(SchedulerError),
}

impl Diagnostic {
    pub fn severity(&self) -> Severity {
        match self {
            Diagnostic::MissingReference { .. }
            | Diagnostic::MissingComponent { .. }
            | Diagnostic::CycleBroken { .. } => Severity::Warning,
            Diagnostic::OperationFailed { .. } => Severity::Error,
            Diagnostic::PassAborted(SchedulerError::Retired) => Severity::Info,
            Diagnostic::PassAborted(_) => Severity::Error,
        }
    }
}
