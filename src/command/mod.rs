//! External command execution
//!
//! This module handles executable path resolution and bounded-timeout
//! script invocation.

pub mod resolver;
pub mod runner;

pub use resolver::{PathResolver, ResolutionError};
pub use runner::{CommandOutcome, CommandRunner, OutcomeStatus};
