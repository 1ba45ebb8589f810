//! Evaluation
//!
//! Tagging, copy-on-write evaluated state and the parallel scheduler.
//!
//! A pass goes through these steps:
//!
//! 1. Queued tag requests are applied and flushed downstream
//! 2. The scheduler runs the tagged operations on a worker pool
//! 3. Operations read and write evaluated copies, never the original scene
//! 4. A completed pass commits its copies; an aborted one discards them

mod context;
mod copies;
pub(crate) mod scheduler;
pub(crate) mod tag;

pub use context::{
    operation, EvalContext, FrameTime, NoopBinder, OperationBinder, OperationFn, OperationKey,
};
pub use copies::{EvaluatedCopy, EvaluatedStore};
pub use scheduler::OperationFailure;
pub use tag::{tagged_operations, PropertyScope, TagQueue, TagRequest};

pub(crate) use copies::{OriginalWrite, PassCopies};
