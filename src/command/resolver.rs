//! Executable path resolution
//!
//! Resolves a command name to an absolute executable path the first time it
//! is asked for, and serves every later request for the same name from a
//! process-lifetime cache. Entries are never evicted: the agent assumes the
//! filesystem and `PATH` stay put while it runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use crate::metrics::FlipFlopMetrics;

/// Failure to locate an executable. Always fatal to the agent.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The command could not be found (or is not executable).
    #[error("can't find command '{name}': {reason}")]
    NotFound {
        /// Command name as it was requested
        name: String,
        /// Why the lookup failed
        reason: String,
    },
}

/// Memoizing command resolver.
///
/// The cache lock is held across the lookup itself so two callers racing on
/// the same name never both hit the filesystem.
pub struct PathResolver {
    cache: Mutex<HashMap<String, PathBuf>>,
    metrics: FlipFlopMetrics,
}

impl PathResolver {
    /// Create an empty resolver reporting into `metrics`
    #[must_use]
    pub fn new(metrics: FlipFlopMetrics) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Resolve `name` to an absolute executable path.
    ///
    /// Names containing a path separator are checked relative to the current
    /// directory; bare names are searched in `PATH`.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, ResolutionError> {
        self.metrics.inc("resolve", "start");

        // A poisoned lock only means another caller panicked mid-insert; the
        // map itself is still consistent.
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(path) = cache.get(name) {
            return Ok(path.clone());
        }

        self.metrics.inc("resolve", "lookup");
        let path = which::which(name).map_err(|e| ResolutionError::NotFound {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        debug!(command = name, path = %path.display(), "resolved command");
        cache.insert(name.to_string(), path.clone());
        Ok(path)
    }

    /// Number of names currently cached
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
