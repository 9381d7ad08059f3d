//! Bounded external command execution
//!
//! Runs a script under a hard deadline, capturing its stdout and stderr in
//! memory. Failures and timeouts are reported in the returned
//! [`CommandOutcome`] and never retried; only a resolution failure is
//! returned as an error.

use std::borrow::Cow;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::resolver::{PathResolver, ResolutionError};
use crate::metrics::FlipFlopMetrics;

/// How long to keep draining pipes after the child exits or is killed.
///
/// A background process that left its group may still hold the pipes open.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// How a command invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Exit code 0
    Success,
    /// Non-zero exit, killed by a signal, or failed to spawn/wait
    Failure,
    /// Still running at the deadline; the process was killed
    TimedOut,
}

impl OutcomeStatus {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::TimedOut => "timeout",
        }
    }
}

/// Result of one external command execution
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// How the command ended
    pub status: OutcomeStatus,
    /// Process exit code (None if killed, timed out, or never started)
    pub exit_code: Option<i32>,
    /// Captured stdout bytes
    pub stdout: Vec<u8>,
    /// Captured stderr bytes
    pub stderr: Vec<u8>,
    /// Wall-clock time from launch to completion
    pub elapsed: Duration,
}

impl CommandOutcome {
    /// Whether the command exited with status 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Captured stdout as text
    #[must_use]
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Captured stderr as text
    #[must_use]
    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Executes scripts with a timeout, resolving them through a shared cache.
pub struct CommandRunner {
    resolver: Arc<PathResolver>,
    metrics: FlipFlopMetrics,
}

impl CommandRunner {
    /// Create a runner using `resolver` for path lookups
    #[must_use]
    pub const fn new(resolver: Arc<PathResolver>, metrics: FlipFlopMetrics) -> Self {
        Self { resolver, metrics }
    }

    /// Run `name` with `args`, killing it if it outlives `timeout`.
    ///
    /// The invocation is counted and timed whatever the outcome.
    pub async fn run(
        &self,
        name: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutcome, ResolutionError> {
        let start = Instant::now();
        self.metrics.inc("run_command", "start");
        self.metrics.inc("run_command", name);

        let result = self.execute(name, args, timeout, start).await;

        self.metrics
            .observe_duration("run_command", name, start.elapsed().as_secs_f64());
        if let Ok(outcome) = &result {
            self.metrics
                .inc("run_command_status", outcome.status.as_str());
            log_outcome(name, args, outcome);
        }
        result
    }

    async fn execute(
        &self,
        name: &str,
        args: &[String],
        timeout: Duration,
        start: Instant,
    ) -> Result<CommandOutcome, ResolutionError> {
        let path = self.resolver.resolve(name)?;
        debug!(command = name, path = %path.display(), ?args, "running command");
        Ok(run_with_timeout(&path, args, timeout, start).await)
    }
}

/// Spawn `path`, wait up to `timeout`, and collect whatever it wrote.
async fn run_with_timeout(
    path: &Path,
    args: &[String],
    timeout: Duration,
    start: Instant,
) -> CommandOutcome {
    let mut child = match TokioCommand::new(path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return CommandOutcome {
                status: OutcomeStatus::Failure,
                exit_code: None,
                stdout: Vec::new(),
                stderr: format!("failed to spawn {}: {e}", path.display()).into_bytes(),
                elapsed: start.elapsed(),
            };
        }
    };

    let stdout = Capture::spawn(child.stdout.take());
    let stderr = Capture::spawn(child.stderr.take());

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    let (status, exit_code, wait_error) = match waited {
        Ok(Ok(exit)) if exit.success() => (OutcomeStatus::Success, exit.code(), None),
        Ok(Ok(exit)) => (OutcomeStatus::Failure, exit.code(), None),
        Ok(Err(e)) => {
            kill_group(&mut child).await;
            (OutcomeStatus::Failure, None, Some(e))
        }
        Err(_) => {
            kill_group(&mut child).await;
            (OutcomeStatus::TimedOut, None, None)
        }
    };

    let stdout = stdout.finish().await;
    let mut stderr = stderr.finish().await;
    if let Some(e) = wait_error {
        stderr.extend_from_slice(format!("failed waiting for {}: {e}", path.display()).as_bytes());
    }

    CommandOutcome {
        status,
        exit_code,
        stdout,
        stderr,
        elapsed: start.elapsed(),
    }
}

/// SIGKILL the child's process group, then reap the child.
///
/// The child leads its own group, so anything the script started dies with
/// it instead of outliving the deadline.
async fn kill_group(child: &mut Child) {
    if let Some(pgid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            debug!(pgid, error = %e, "failed to signal process group");
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Background reader collecting a child pipe into a shared buffer, so bytes
/// read before an abort are not lost.
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
}

impl Capture {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let handle = pipe.map(|mut pipe| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                while let Ok(n) = pipe.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    buffer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]);
                }
            })
        });
        Self { buffer, handle }
    }

    async fn finish(self) -> Vec<u8> {
        if let Some(mut handle) = self.handle {
            if tokio::time::timeout(PIPE_DRAIN_GRACE, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *buffer)
    }
}

fn log_outcome(name: &str, args: &[String], outcome: &CommandOutcome) {
    let elapsed_ms = outcome.elapsed.as_millis();
    match outcome.status {
        OutcomeStatus::Success => {
            debug!(command = name, ?args, elapsed_ms, "command succeeded");
        }
        OutcomeStatus::Failure => {
            warn!(
                command = name,
                ?args,
                exit_code = ?outcome.exit_code,
                elapsed_ms,
                stdout = %outcome.stdout_lossy(),
                stderr = %outcome.stderr_lossy(),
                "command failed"
            );
        }
        OutcomeStatus::TimedOut => {
            warn!(
                command = name,
                ?args,
                elapsed_ms,
                stdout = %outcome.stdout_lossy(),
                stderr = %outcome.stderr_lossy(),
                "command timed out"
            );
        }
    }
}
