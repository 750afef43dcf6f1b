//! Process spawning, output capture and termination.
//!
//! Each invocation gets its own stdout/stderr drain tasks so a chatty child
//! can never fill a pipe and stall while we wait for it to exit. On Unix the
//! child is placed in its own process group so a timeout or cancellation
//! takes down anything it forked as well.

use crate::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Maximum bytes retained per stream. Anything beyond is drained and dropped.
pub const MAX_CAPTURE_BYTES: usize = 16 * 1024 * 1024;

/// Time between SIGTERM and SIGKILL when terminating a child.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// How long to wait for the drain tasks once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 8 * 1024;

/// Text captured from a child's stdout and stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,

    /// Set when either stream hit [`MAX_CAPTURE_BYTES`] or could not be fully drained
    #[serde(default)]
    pub truncated: bool,
}

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,

    /// Environment overrides applied to the child only
    pub env: Vec<(String, String)>,

    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// Result of a child that ran to completion (whatever its exit status).
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code, or `128 + signal` when the child was killed by a signal
    pub exit_status: i32,
    pub output: CapturedOutput,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Runs external executables with captured output.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace_period: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Override the SIGTERM to SIGKILL grace period
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Run `spec` to completion or until its timeout fires.
    pub async fn run(&self, spec: &ProcessSpec) -> Result<ProcessOutput> {
        self.run_until(spec, &CancellationToken::new()).await
    }

    /// Run `spec` to completion, until its timeout fires, or until `cancel` is triggered.
    ///
    /// # Returns
    /// * `Ok(ProcessOutput)` - The child exited, with any exit status
    /// * `Err(AgentError::LaunchFailure)` - The program could not be started
    /// * `Err(AgentError::Timeout)` - The timeout fired; the child was terminated
    /// * `Err(AgentError::Cancelled)` - `cancel` fired; the child was terminated
    #[instrument(skip(self, spec, cancel), fields(program = %spec.program.display(), args = ?spec.args))]
    pub async fn run_until(
        &self,
        spec: &ProcessSpec,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled {
                partial: Box::default(),
            });
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| AgentError::LaunchFailure {
            binary: spec.program.clone(),
            source,
        })?;

        let pid = child.id();
        info!(pid = ?pid, "Process started");

        let stdout = child.stdout.take().ok_or_else(|| AgentError::LaunchFailure {
            binary: spec.program.clone(),
            source: std::io::Error::other("stdout pipe not available"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| AgentError::LaunchFailure {
            binary: spec.program.clone(),
            source: std::io::Error::other("stderr pipe not available"),
        })?;

        let stdout_drain = Drain::spawn(stdout);
        let stderr_drain = Drain::spawn(stderr);

        enum ExitReason {
            Exited(ExitStatus),
            WaitError(std::io::Error),
            TimedOut,
            Cancelled,
        }

        let deadline = async {
            match spec.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let reason = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ExitReason::Exited(status),
                Err(e) => ExitReason::WaitError(e),
            },
            _ = deadline => ExitReason::TimedOut,
            _ = cancel.cancelled() => ExitReason::Cancelled,
        };

        match reason {
            ExitReason::TimedOut | ExitReason::Cancelled => {
                terminate(&mut child, self.grace_period).await;
            }
            // Background processes the child left behind would hold the pipes open.
            ExitReason::Exited(_) | ExitReason::WaitError(_) => kill_leftovers(pid),
        }

        let output = collect_output(stdout_drain, stderr_drain).await;
        let elapsed = start.elapsed();

        match reason {
            ExitReason::Exited(status) => {
                let exit_status = exit_code(status);
                debug!(
                    exit_status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    stdout_len = output.stdout.len(),
                    stderr_len = output.stderr.len(),
                    "Process exited"
                );
                Ok(ProcessOutput {
                    exit_status,
                    output,
                    elapsed,
                })
            }
            ExitReason::WaitError(e) => {
                warn!(error = %e, "Failed to wait for process");
                Err(AgentError::Io(e))
            }
            ExitReason::TimedOut => {
                let timeout_ms = spec.timeout.unwrap_or_default().as_millis() as u64;
                warn!(timeout_ms, "Process timed out and was terminated");
                Err(AgentError::Timeout {
                    timeout_ms,
                    partial: Box::new(output),
                })
            }
            ExitReason::Cancelled => {
                warn!("Process cancelled and was terminated");
                Err(AgentError::Cancelled {
                    partial: Box::new(output),
                })
            }
        }
    }
}

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Capture>>;

fn lock(capture: &SharedCapture) -> MutexGuard<'_, Capture> {
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A pipe being drained in the background. Bytes land in `capture` as they
/// are read, so they survive an aborted task.
struct Drain {
    task: JoinHandle<()>,
    capture: SharedCapture,
}

impl Drain {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(reader: R) -> Self {
        let capture = SharedCapture::default();
        let task = tokio::spawn(drain(reader, Arc::clone(&capture)));
        Self { task, capture }
    }

    /// Wait for EOF, then hand back what was read and whether it is complete.
    async fn finish(self) -> (Vec<u8>, bool) {
        let Drain { mut task, capture } = self;

        let complete = match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Output drain task failed");
                false
            }
            Err(_) => {
                // Something outside the process group still holds the pipe.
                warn!("Output drain did not finish, keeping what was read");
                task.abort();
                false
            }
        };

        let mut capture = lock(&capture);
        let bytes = std::mem::take(&mut capture.bytes);
        (bytes, capture.truncated || !complete)
    }
}

/// Read a pipe to EOF, keeping at most [`MAX_CAPTURE_BYTES`].
async fn drain<R: AsyncRead + Unpin>(mut reader: R, capture: SharedCapture) {
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let mut capture = lock(&capture);
                let room = MAX_CAPTURE_BYTES.saturating_sub(capture.bytes.len());
                if n > room {
                    capture.truncated = true;
                }
                capture.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                warn!(error = %e, "Error reading child output");
                break;
            }
        }
    }
}

async fn collect_output(stdout: Drain, stderr: Drain) -> CapturedOutput {
    let ((stdout, stdout_truncated), (stderr, stderr_truncated)) =
        tokio::join!(stdout.finish(), stderr.finish());

    CapturedOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        truncated: stdout_truncated || stderr_truncated,
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// SIGTERM the child's process group, then SIGKILL it if it outlives `grace`.
#[cfg(unix)]
async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };
    let pgid = -(pid as libc::pid_t);

    // SAFETY: kill(2) has no memory-safety preconditions. The group was
    // created for this child by `process_group(0)`.
    if unsafe { libc::kill(pgid, libc::SIGTERM) } != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM to process group failed");
    }

    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }

    warn!(pid, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, sending SIGKILL");
    // SAFETY: as above.
    if unsafe { libc::kill(pgid, libc::SIGKILL) } != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "SIGKILL to process group failed");
    }
    let _ = child.wait().await;
}

/// SIGKILL whatever is left in the process group of a child that has exited.
#[cfg(unix)]
fn kill_leftovers(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };

    // SAFETY: see `terminate`. ESRCH (group already empty) is the common case.
    if unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) } == 0 {
        debug!(pid, "Killed processes left behind by the child");
    }
}

#[cfg(not(unix))]
fn kill_leftovers(_pid: Option<u32>) {}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _grace: Duration) {
    let _ = child.kill().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let runner = ProcessRunner::new();
        let out = runner
            .run(&sh("echo hello; echo oops >&2"))
            .await
            .unwrap();

        assert!(out.success());
        assert_eq!(out.output.stdout, "hello\n");
        assert_eq!(out.output.stderr, "oops\n");
        assert!(!out.output.truncated);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let runner = ProcessRunner::new();
        let out = runner.run(&sh("echo partial; exit 3")).await.unwrap();

        assert!(!out.success());
        assert_eq!(out.exit_status, 3);
        assert_eq!(out.output.stdout, "partial\n");
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_failure() {
        let runner = ProcessRunner::new();
        let err = runner
            .run(&ProcessSpec::new("/definitely/not/a/real/binary"))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::LaunchFailure { .. }));
    }

    #[tokio::test]
    async fn test_env_reaches_child_only() {
        let runner = ProcessRunner::new();
        let spec = sh("printf %s \"$FLEET_TEST_VISIBLE\"").env("FLEET_TEST_VISIBLE", "3");
        let out = runner.run(&spec).await.unwrap();

        assert_eq!(out.output.stdout, "3");
        assert!(std::env::var("FLEET_TEST_VISIBLE").is_err());
    }

    #[tokio::test]
    async fn test_large_output_does_not_deadlock() {
        let runner = ProcessRunner::new();
        let spec = sh("head -c 1000000 /dev/zero; head -c 1000000 /dev/zero >&2")
            .timeout(Some(Duration::from_secs(30)));
        let out = runner.run(&spec).await.unwrap();

        assert!(out.success());
        assert_eq!(out.output.stdout.len(), 1_000_000);
        assert_eq!(out.output.stderr.len(), 1_000_000);
    }

    #[tokio::test]
    async fn test_background_leftover_does_not_lose_output() {
        let runner = ProcessRunner::new();

        let start = Instant::now();
        let out = runner.run(&sh("echo found:7; sleep 30 &")).await.unwrap();

        assert!(start.elapsed() < DRAIN_GRACE);
        assert!(out.success());
        assert_eq!(out.output.stdout, "found:7\n");
        assert!(!out.output.truncated);
    }

    #[tokio::test]
    async fn test_timeout_terminates_and_keeps_partial_output() {
        let runner = ProcessRunner::new().with_grace_period(Duration::from_millis(500));
        let spec = sh("echo started; exec sleep 30").timeout(Some(Duration::from_millis(300)));

        let start = Instant::now();
        let err = runner.run(&spec).await.unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(10));
        match err {
            AgentError::Timeout {
                timeout_ms,
                partial,
            } => {
                assert_eq!(timeout_ms, 300);
                assert_eq!(partial.stdout, "started\n");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_terminates_child() {
        let runner = ProcessRunner::new().with_grace_period(Duration::from_millis(500));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let err = runner
            .run_until(&sh("exec sleep 30"), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_already_cancelled_spawns_nothing() {
        let runner = ProcessRunner::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runner
            .run_until(&ProcessSpec::new("/definitely/not/a/real/binary"), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Cancelled { .. }));
    }

    #[test]
    fn test_spec_builder() {
        let spec = ProcessSpec::new("/opt/miner")
            .arg(2)
            .arg(1000u64)
            .env("CUDA_VISIBLE_DEVICES", "2")
            .timeout(Some(Duration::from_secs(5)));

        assert_eq!(spec.program(), Path::new("/opt/miner"));
        assert_eq!(spec.args, vec!["2", "1000"]);
        assert_eq!(spec.env, vec![("CUDA_VISIBLE_DEVICES".to_string(), "2".to_string())]);
        assert_eq!(spec.timeout, Some(Duration::from_secs(5)));
    }
}
