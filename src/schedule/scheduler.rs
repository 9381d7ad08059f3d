//! Toggle scheduler
//!
//! Drives the flip/flop cycle off a fixed-rate sub-tick clock. Sub-tick zero
//! of every period switches profiles: after the first period it tears the
//! old profile down and waits out the settle delay, then applies the next
//! profile. Every other sub-tick only reports progress.
//!
//! Script failures never stop the loop. Only a resolution failure (a script
//! that cannot be found) ends it with an error.

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::config::{ConfigError, CycleConfig};
use super::state::{CycleState, Tick, TickAction};
use crate::command::{CommandOutcome, CommandRunner, ResolutionError};
use crate::metrics::FlipFlopMetrics;

/// Something that can run a named script with a deadline.
///
/// Implemented by [`CommandRunner`]; tests substitute a recording fake.
pub trait ScriptRunner {
    /// Run `name` with `args`, giving up after `timeout`
    fn run(
        &self,
        name: &str,
        args: &[String],
        timeout: Duration,
    ) -> impl Future<Output = Result<CommandOutcome, ResolutionError>> + Send;
}

impl ScriptRunner for CommandRunner {
    fn run(
        &self,
        name: &str,
        args: &[String],
        timeout: Duration,
    ) -> impl Future<Output = Result<CommandOutcome, ResolutionError>> + Send {
        Self::run(self, name, args, timeout)
    }
}

enum Step {
    Continue,
    Cancelled,
}

/// The flip/flop state machine bound to a clock and a script runner
pub struct ToggleScheduler<R> {
    config: CycleConfig,
    runner: R,
    metrics: FlipFlopMetrics,
    state: CycleState,
}

impl<R: ScriptRunner> ToggleScheduler<R> {
    /// Create a scheduler; fails if `config` breaks the cycle invariants
    pub fn new(
        config: CycleConfig,
        runner: R,
        metrics: FlipFlopMetrics,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = CycleState::new(config.subdivisions);
        Ok(Self {
            config,
            runner,
            metrics,
            state,
        })
    }

    /// Current cycle position and intended phase
    #[must_use]
    pub const fn state(&self) -> &CycleState {
        &self.state
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Cancellation is honoured while waiting for a sub-tick, during the
    /// settle wait, and before each script launch. A script already running
    /// is allowed to finish or time out.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<(), ResolutionError> {
        let sub_tick = self.config.sub_tick_duration();
        let mut ticker = interval_at(Instant::now() + sub_tick, sub_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            period = ?self.config.period,
            subdivisions = self.config.subdivisions,
            interface = %self.config.interface,
            flip = %self.config.flip_latency,
            flop = %self.config.flop_latency,
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!(cycle = self.state.cycle_index(), "shutdown requested, scheduler stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let tick = self.state.advance();
            self.observe(&tick);

            if let TickAction::Transition { teardown } = tick.action {
                if let Step::Cancelled = self.transition(teardown, shutdown).await? {
                    info!("shutdown requested mid-transition, scheduler stopping");
                    return Ok(());
                }
            }
        }
    }

    fn observe(&self, tick: &Tick) {
        self.metrics.inc("scheduler", "sub_tick");
        if tick.sub_tick_index == 0 {
            self.metrics.inc("scheduler", "period");
            self.metrics.set_cycle_index(tick.cycle_index);
        }
        self.metrics.set_progress(tick.progress());

        let latency = self.config.latency_for(self.state.phase());
        if self.config.diagnostics {
            info!(
                "{} tick latency {} {} / {} ~= {:.2}",
                self.config.tag,
                latency,
                tick.sub_tick_index,
                tick.subdivisions,
                tick.progress()
            );
        } else {
            trace!(
                cycle = tick.cycle_index,
                sub_tick = tick.sub_tick_index,
                latency,
                "tick"
            );
        }
    }

    async fn transition(
        &mut self,
        teardown: bool,
        shutdown: &CancellationToken,
    ) -> Result<Step, ResolutionError> {
        self.metrics.inc("scheduler", "transition");

        if teardown {
            // Armed before teardown runs: the settle wait covers the
            // teardown itself and ends at the same instant however long the
            // script took or whether it failed.
            let settled_at = Instant::now() + self.config.settle_delay;
            debug!(settle_delay = ?self.config.settle_delay, "tearing down current profile");

            self.runner
                .run(
                    &self.config.scripts.teardown,
                    &[self.config.interface.clone()],
                    self.config.command_timeout,
                )
                .await?;
            self.inspect(shutdown).await?;

            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(Step::Cancelled),
                () = sleep_until(settled_at) => {}
            }
            trace!("settled");
        }

        if shutdown.is_cancelled() {
            return Ok(Step::Cancelled);
        }

        let phase = self.state.toggle_phase();
        self.metrics.inc("scheduler", phase.as_str());
        self.metrics.set_phase(phase);

        let latency = self.config.latency_for(phase).to_string();
        info!(
            %phase,
            latency = %latency,
            interface = %self.config.interface,
            cycle = self.state.cycle_index(),
            "applying latency profile"
        );

        let outcome = self
            .runner
            .run(
                &self.config.scripts.apply,
                &[self.config.interface.clone(), latency],
                self.config.command_timeout,
            )
            .await?;
        if !outcome.is_success() {
            // The phase is not rolled back: the next transition toggles from
            // the intended phase even if the interface never received it.
            warn!(
                %phase,
                status = outcome.status.as_str(),
                "apply did not succeed, intended phase may differ from the interface"
            );
        }

        self.inspect(shutdown).await?;
        Ok(Step::Continue)
    }

    /// Run the inspect script for its log output only.
    async fn inspect(&self, shutdown: &CancellationToken) -> Result<(), ResolutionError> {
        if !self.config.diagnostics || shutdown.is_cancelled() {
            return Ok(());
        }
        let outcome = self
            .runner
            .run(
                &self.config.scripts.inspect,
                &[self.config.interface.clone()],
                self.config.command_timeout,
            )
            .await?;
        info!(
            status = outcome.status.as_str(),
            stdout = %outcome.stdout_lossy(),
            stderr = %outcome.stderr_lossy(),
            "interface state"
        );
        Ok(())
    }
}
