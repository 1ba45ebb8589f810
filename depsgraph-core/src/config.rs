//! Configuration
//!
//! Tunables of the build and evaluation pipeline. None of them affect the
//! correctness of the result, only how much work is done to get there.

use std::num::NonZeroUsize;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings for a [`Depsgraph`](crate::Depsgraph).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepsgraphConfig {
    /// Worker threads per evaluation pass. `0` uses the available parallelism.
    pub threads: usize,

    /// Remove relations implied by longer paths before scheduling.
    pub transitive_reduction: bool,

    /// Above this many entities with changed relations, rebuild from scratch
    /// instead of patching the existing graph.
    pub incremental_rebuild_limit: usize,

    /// Turn a panicking operation into a recorded failure. When off, a panic
    /// aborts the pass and the last committed evaluated state is kept.
    pub catch_panics: bool,

    /// Transitive reduction is skipped for graphs with more operations.
    pub reduction_operation_limit: usize,
}

impl DepsgraphConfig {
    /// Parse a configuration from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Single worker, for deterministic debugging.
    pub fn single_threaded() -> Self {
        Self {
            threads: 1,
            ..Self::default()
        }
    }

    /// Number of worker threads to spawn for a pass.
    pub fn worker_count(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }
}

impl Default for DepsgraphConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            transitive_reduction: true,
            incremental_rebuild_limit: 8,
            catch_panics: true,
            reduction_operation_limit: 200_000,
        }
    }
}
