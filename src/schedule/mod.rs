//! Flip/flop scheduling
//!
//! This module handles cycle configuration, the pure cycle state machine,
//! and the timer-driven scheduler that runs the scripts.

pub mod config;
pub mod scheduler;
pub mod state;

pub use config::{ConfigError, CycleConfig, ScriptPaths};
pub use scheduler::{ScriptRunner, ToggleScheduler};
pub use state::{CyclePhase, CycleState, Tick, TickAction};
