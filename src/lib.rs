//! Flipflop - network latency chaos agent
//!
//! Flipflop periodically toggles the simulated latency of a network
//! interface between two profiles by driving external traffic-control
//! scripts, and exposes counters and timings for Prometheus.

// Allow multiple crate versions from dependencies (can't easily control)
#![allow(clippy::multiple_crate_versions)]

pub mod cli;
pub mod command;
pub mod metrics;
pub mod preflight;
pub mod schedule;

// Re-export commonly used types
pub use command::{CommandOutcome, CommandRunner, OutcomeStatus, PathResolver, ResolutionError};
pub use metrics::{FlipFlopMetrics, MetricsRegistry, SharedMetricsRegistry};
pub use preflight::PreflightReport;
pub use schedule::{ConfigError, CycleConfig, CyclePhase, CycleState, ScriptPaths, ToggleScheduler};
