//! Startup preflight checks
//!
//! Confirms the three scripts exist on disk and resolve to executables
//! before the scheduler starts. `flipflop --check` prints the report
//! without starting anything.

use std::path::{Path, PathBuf};

use crate::command::PathResolver;
use crate::schedule::{ConfigError, ScriptPaths};

/// What role a script plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRole {
    /// Applies a latency profile
    Apply,
    /// Removes the current profile
    Teardown,
    /// Prints the interface state
    Inspect,
}

impl ScriptRole {
    /// Lowercase label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Teardown => "teardown",
            Self::Inspect => "inspect",
        }
    }
}

/// Preflight result for a single script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCheck {
    /// Which script this is
    pub role: ScriptRole,
    /// Path as configured
    pub configured: String,
    /// Whether the file exists
    pub exists: bool,
    /// Absolute executable path, if it resolves
    pub resolved: Option<PathBuf>,
    /// Why resolution failed, if it did
    pub problem: Option<String>,
}

/// Preflight results for all scripts
#[derive(Debug, Clone)]
pub struct PreflightReport {
    /// One entry per script, in apply/teardown/inspect order
    pub scripts: Vec<ScriptCheck>,
}

impl PreflightReport {
    /// True when every script exists
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.scripts.iter().all(|s| s.exists)
    }

    /// True when every script exists and resolves to an executable
    #[must_use]
    pub fn all_resolved(&self) -> bool {
        self.scripts.iter().all(|s| s.resolved.is_some())
    }

    /// First missing or unresolvable script, as a startup error
    pub fn into_result(self) -> Result<Self, ConfigError> {
        if let Some(missing) = self.scripts.iter().find(|s| !s.exists) {
            return Err(ConfigError::MissingScript(PathBuf::from(&missing.configured)));
        }
        if let Some(broken) = self.scripts.iter().find(|s| s.resolved.is_none()) {
            return Err(ConfigError::Unresolvable {
                path: PathBuf::from(&broken.configured),
                reason: broken.problem.clone().unwrap_or_default(),
            });
        }
        Ok(self)
    }
}

/// Check every script. Resolution goes through `resolver`, so successful
/// lookups are already cached when the scheduler starts.
#[must_use]
pub fn check(scripts: &ScriptPaths, resolver: &PathResolver) -> PreflightReport {
    let roles = [ScriptRole::Apply, ScriptRole::Teardown, ScriptRole::Inspect];
    let scripts = roles
        .into_iter()
        .zip(scripts.all())
        .map(|(role, configured)| {
            let exists = file_exists(Path::new(configured));
            let (resolved, problem) = if exists {
                match resolver.resolve(configured) {
                    Ok(path) => (Some(path), None),
                    Err(e) => (None, Some(e.to_string())),
                }
            } else {
                (None, Some("file doesn't exist".to_string()))
            };
            ScriptCheck {
                role,
                configured: configured.to_string(),
                exists,
                resolved,
                problem,
            }
        })
        .collect();
    PreflightReport { scripts }
}

fn file_exists(path: &Path) -> bool {
    // Bare names live in PATH, not the working directory.
    if path.components().count() == 1 && !path.exists() {
        return which::which(path).is_ok();
    }
    path.exists()
}
