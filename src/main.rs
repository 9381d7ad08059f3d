//! Flipflop - network latency chaos agent
//!
//! CLI entry point: builds the cycle configuration, runs preflight, starts
//! the metrics endpoint and signal handler, then runs the scheduler until
//! SIGINT/SIGTERM.

// Allow multiple crate versions from dependencies (can't easily control)
#![allow(clippy::multiple_crate_versions)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use flipflop::cli::{render_banner, render_preflight_report};
use flipflop::metrics::server;
use flipflop::{
    preflight, CommandRunner, CycleConfig, MetricsRegistry, PathResolver, SharedMetricsRegistry,
    ToggleScheduler,
};

/// Network latency chaos agent
///
/// Alternates an interface between two netem latency profiles on a fixed
/// period by running external apply/teardown/inspect scripts.
#[derive(Parser, Debug)]
#[command(name = "flipflop", version, about)]
struct Cli {
    /// Optional TOML file with cycle settings (flags override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Full flip+flop period [default: 1m]
    #[arg(long, value_parser = humantime::parse_duration)]
    period: Option<Duration>,

    /// Sub-ticks per period, for progress reporting [default: 6]
    #[arg(long)]
    subdivisions: Option<u32>,

    /// Interface passed to the scripts [default: eth0]
    #[arg(long)]
    interface: Option<String>,

    /// Latency applied in the flip phase [default: 100ms]
    #[arg(long)]
    flip_latency: Option<String>,

    /// Latency applied in the flop phase [default: 600ms]
    #[arg(long)]
    flop_latency: Option<String>,

    /// Script applying a profile [default: ./configure_tc_qdisc_netem.bash]
    #[arg(long)]
    apply_script: Option<String>,

    /// Script removing the current profile [default: ./stop.bash]
    #[arg(long)]
    teardown_script: Option<String>,

    /// Script printing the interface state [default: ./show.bash]
    #[arg(long)]
    inspect_script: Option<String>,

    /// Pause after teardown before applying the next profile [default: 10s]
    #[arg(long, value_parser = humantime::parse_duration)]
    settle_delay: Option<Duration>,

    /// Deadline for each script run [default: 2s]
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Tag used in progress lines [default: flipper]
    #[arg(long)]
    tag: Option<String>,

    /// Prometheus listen address
    #[arg(long, default_value = "0.0.0.0:9901")]
    metrics_listen: SocketAddr,

    /// Prometheus scrape path
    #[arg(long, default_value = "/metrics")]
    metrics_path: String,

    /// Disable the Prometheus endpoint
    #[arg(long)]
    no_metrics: bool,

    /// Tokio worker threads
    #[arg(long, default_value_t = 1)]
    worker_threads: usize,

    /// Log verbosity: -v debug, -vv trace. Also forces diagnostics on
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Skip the inspect script and per-sub-tick progress lines
    #[arg(long, conflicts_with = "verbose")]
    no_diagnostics: bool,

    /// Check the scripts, print a report, and exit
    #[arg(long)]
    check: bool,
}

impl Cli {
    /// Defaults, then the config file, then flags.
    fn cycle_config(&self) -> Result<CycleConfig> {
        let mut config = match &self.config {
            Some(path) => CycleConfig::from_path(path)
                .with_context(|| format!("Failed to load config from '{}'", path.display()))?,
            None => CycleConfig::default(),
        };

        if let Some(period) = self.period {
            config.period = period;
        }
        if let Some(subdivisions) = self.subdivisions {
            config.subdivisions = subdivisions;
        }
        if let Some(interface) = &self.interface {
            config.interface.clone_from(interface);
        }
        if let Some(latency) = &self.flip_latency {
            config.flip_latency.clone_from(latency);
        }
        if let Some(latency) = &self.flop_latency {
            config.flop_latency.clone_from(latency);
        }
        if let Some(script) = &self.apply_script {
            config.scripts.apply.clone_from(script);
        }
        if let Some(script) = &self.teardown_script {
            config.scripts.teardown.clone_from(script);
        }
        if let Some(script) = &self.inspect_script {
            config.scripts.inspect.clone_from(script);
        }
        if let Some(delay) = self.settle_delay {
            config.settle_delay = delay;
        }
        if let Some(timeout) = self.timeout {
            config.command_timeout = timeout;
        }
        if let Some(tag) = &self.tag {
            config.tag.clone_from(tag);
        }
        if self.no_diagnostics {
            config.diagnostics = false;
        } else if self.verbose > 0 {
            config.diagnostics = true;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Log filter for a verbosity count, unless `RUST_LOG` is set.
fn log_filter(verbose: u8) -> EnvFilter {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,flipflop={level}")))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(log_filter(cli.verbose))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = cli.cycle_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.worker_threads.max(1))
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: CycleConfig) -> Result<()> {
    let registry: SharedMetricsRegistry =
        Arc::new(MetricsRegistry::new().context("Failed to initialize metrics registry")?);
    let metrics = registry.metrics().clone();
    let resolver = Arc::new(PathResolver::new(metrics.clone()));

    let report = preflight::check(&config.scripts, &resolver);
    if cli.check {
        eprintln!("{}", render_preflight_report(&report));
        if report.all_resolved() {
            return Ok(());
        }
        std::process::exit(1);
    }
    report
        .into_result()
        .context("Preflight failed: a script is missing or not executable")?;

    eprintln!("{}", render_banner(&config));

    let shutdown = CancellationToken::new();
    let sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM")?;
    let sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT")?;
    tokio::spawn(cancel_on_signal(sigterm, sigint, shutdown.clone()));

    let mut metrics_task = if cli.no_metrics {
        info!("Metrics HTTP server disabled");
        None
    } else {
        Some(tokio::spawn(server::serve(
            Arc::clone(&registry),
            cli.metrics_listen,
            cli.metrics_path.clone(),
            shutdown.clone(),
        )))
    };

    let runner = CommandRunner::new(resolver, metrics.clone());
    let mut scheduler =
        ToggleScheduler::new(config, runner, metrics).context("Invalid configuration")?;

    let result = tokio::select! {
        result = scheduler.run(&shutdown) => result.context("Scheduler stopped"),
        result = metrics_exit(&mut metrics_task) => result,
    };

    shutdown.cancel();
    if let Some(task) = metrics_task {
        let _ = task.await;
    }

    if result.is_ok() {
        info!("flipflop: That's all Folks!");
    }
    result
}

async fn cancel_on_signal(mut sigterm: Signal, mut sigint: Signal, shutdown: CancellationToken) {
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    info!("Signal caught, closing application");
    shutdown.cancel();
}

/// Resolves when the metrics server stops; never, if it is disabled.
async fn metrics_exit(task: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *task = None;
    match joined {
        Ok(Ok(())) => bail!("Metrics server exited unexpectedly"),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(e).context("Metrics server task panicked"),
    }
}
