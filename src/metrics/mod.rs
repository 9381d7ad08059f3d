//! Prometheus instrumentation
//!
//! Counters and command-duration histograms shared by the resolver, runner
//! and scheduler. Every series carries the labels `function`, `variable` and
//! `type`, so a scrape reads e.g.
//! `flipflop_counters_total{function="scheduler",variable="flip",type="counter"}`.
//!
//! All handles use interior mutability and are cheap to clone; the registry
//! can be scraped concurrently with updates.

pub mod server;

use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

use crate::schedule::CyclePhase;

/// Maximum length for label values. Script paths end up as labels.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Buckets for command durations (seconds). Scripts are expected to finish
/// well under the default 2s timeout.
pub const COMMAND_DURATION_BUCKETS: &[f64] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Handles for every flipflop metric family.
#[derive(Clone)]
pub struct FlipFlopMetrics {
    counters: CounterVec,
    durations: HistogramVec,
    progress: Gauge,
    phase: IntGauge,
    cycle_index: IntGauge,
}

impl FlipFlopMetrics {
    /// Creates the metric families and registers them with `registry`.
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let counters = CounterVec::new(
            Opts::new("flipflop_counters_total", "flipflop event counters"),
            &["function", "variable", "type"],
        )?;
        registry.register(Box::new(counters.clone()))?;

        let durations = HistogramVec::new(
            HistogramOpts::new(
                "flipflop_command_duration_seconds",
                "Wall-clock duration of external command executions",
            )
            .buckets(COMMAND_DURATION_BUCKETS.to_vec()),
            &["function", "variable", "type"],
        )?;
        registry.register(Box::new(durations.clone()))?;

        let progress = Gauge::with_opts(Opts::new(
            "flipflop_sub_tick_progress",
            "Fraction of the current period elapsed, in sub-ticks",
        ))?;
        registry.register(Box::new(progress.clone()))?;

        let phase = IntGauge::with_opts(Opts::new(
            "flipflop_phase",
            "Intended latency profile (1 = flip, 0 = flop)",
        ))?;
        registry.register(Box::new(phase.clone()))?;

        let cycle_index = IntGauge::with_opts(Opts::new(
            "flipflop_cycle_index",
            "Index of the period currently running",
        ))?;
        registry.register(Box::new(cycle_index.clone()))?;

        Ok(Self {
            counters,
            durations,
            progress,
            phase,
            cycle_index,
        })
    }

    /// Increments the `(function, variable)` counter.
    pub fn inc(&self, function: &str, variable: &str) {
        self.counters
            .with_label_values(&[truncate_label(function), truncate_label(variable), "counter"])
            .inc();
    }

    /// Current value of the `(function, variable)` counter.
    #[must_use]
    pub fn counter(&self, function: &str, variable: &str) -> f64 {
        self.counters
            .with_label_values(&[truncate_label(function), truncate_label(variable), "counter"])
            .get()
    }

    /// Records one duration observation, in seconds.
    pub fn observe_duration(&self, function: &str, variable: &str, secs: f64) {
        self.durations
            .with_label_values(&[
                truncate_label(function),
                truncate_label(variable),
                "histogram",
            ])
            .observe(secs);
    }

    /// Number of duration observations recorded for `(function, variable)`.
    #[must_use]
    pub fn duration_count(&self, function: &str, variable: &str) -> u64 {
        self.durations
            .with_label_values(&[
                truncate_label(function),
                truncate_label(variable),
                "histogram",
            ])
            .get_sample_count()
    }

    /// Sets the sub-tick progress gauge.
    pub fn set_progress(&self, fraction: f64) {
        self.progress.set(fraction);
    }

    /// Current sub-tick progress.
    #[must_use]
    pub fn progress(&self) -> f64 {
        self.progress.get()
    }

    /// Records the phase the scheduler now intends to have applied.
    pub fn set_phase(&self, phase: CyclePhase) {
        self.phase.set(match phase {
            CyclePhase::Flip => 1,
            CyclePhase::Flop => 0,
        });
    }

    /// Records the index of the running period.
    pub fn set_cycle_index(&self, index: u64) {
        self.cycle_index
            .set(i64::try_from(index).unwrap_or(i64::MAX));
    }
}

/// Owns the Prometheus registry and the flipflop metric handles.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    metrics: FlipFlopMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with every flipflop metric registered.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let metrics = FlipFlopMetrics::new(&registry)?;
        Ok(Self { registry, metrics })
    }

    /// Metric handles to pass to components.
    #[must_use]
    pub const fn metrics(&self) -> &FlipFlopMetrics {
        &self.metrics
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry for the scrape endpoint.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Truncates a label value at a UTF-8 boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        value
    } else {
        let end = value
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
            .last()
            .unwrap_or(0);
        &value[..end]
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)] // Prometheus counters return exact integer values as f64
mod tests {
    use super::*;

    #[test]
    fn test_registry_creation() {
        let registry = MetricsRegistry::new().expect("registry creation should succeed");
        assert!(registry.encode_text().is_ok());
    }

    #[test]
    fn test_counter_increments() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.metrics();

        assert_eq!(metrics.counter("scheduler", "flip"), 0.0);
        metrics.inc("scheduler", "flip");
        metrics.inc("scheduler", "flip");
        assert_eq!(metrics.counter("scheduler", "flip"), 2.0);
        assert_eq!(metrics.counter("scheduler", "flop"), 0.0);
    }

    #[test]
    fn test_clones_share_series() {
        let registry = MetricsRegistry::new().unwrap();
        let a = registry.metrics().clone();
        let b = registry.metrics().clone();

        a.inc("resolve", "lookup");
        assert_eq!(b.counter("resolve", "lookup"), 1.0);
    }

    #[test]
    fn test_duration_observations() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.metrics();

        metrics.observe_duration("run_command", "./stop.bash", 0.02);
        metrics.observe_duration("run_command", "./stop.bash", 1.5);
        assert_eq!(metrics.duration_count("run_command", "./stop.bash"), 2);
        assert_eq!(metrics.duration_count("run_command", "./show.bash"), 0);
    }

    #[test]
    fn test_encode_text_contains_labels() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.metrics();
        metrics.inc("scheduler", "transition");
        metrics.observe_duration("run_command", "apply", 0.1);
        metrics.set_phase(CyclePhase::Flip);

        let text = registry.encode_text().unwrap();
        assert!(text.contains("flipflop_counters_total"));
        assert!(text.contains(r#"function="scheduler""#));
        assert!(text.contains(r#"variable="transition""#));
        assert!(text.contains(r#"type="counter""#));
        assert!(text.contains("flipflop_command_duration_seconds_bucket"));
        assert!(text.contains(r#"type="histogram""#));
        assert!(text.contains("flipflop_phase 1"));
    }

    #[test]
    fn test_progress_gauge() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.metrics();
        metrics.set_progress(0.5);
        assert_eq!(metrics.progress(), 0.5);
    }

    #[test]
    fn test_truncate_label_short() {
        assert_eq!(truncate_label("apply"), "apply");
    }

    #[test]
    fn test_truncate_label_long() {
        let long = "a".repeat(100);
        assert_eq!(truncate_label(&long).len(), MAX_LABEL_VALUE_LEN);
    }

    #[test]
    fn test_truncate_label_utf8_boundary() {
        let s = format!("{}é", "a".repeat(MAX_LABEL_VALUE_LEN - 1));
        let truncated = truncate_label(&s);
        assert!(truncated.len() <= MAX_LABEL_VALUE_LEN);
        assert!(s.is_char_boundary(truncated.len()));
    }
}
