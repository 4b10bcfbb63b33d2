//! Stage executor: runs one stage implementation as an isolated process.
//!
//! The process contract is fixed: `<program> <output_dir> [<input_dir>]
//! [<config>]`, exit code 0 for success. The executor enforces the per-stage
//! timeout and the run-wide cancellation signal, and keeps the tail of both
//! output streams for diagnostics.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use feedingest_discovery::StageCommand;
use feedingest_shared::{SiteId, Stage};

use crate::cancel::CancelSignal;

/// Bytes of stdout/stderr kept per stream.
pub const OUTPUT_TAIL_BYTES: usize = 16 * 1024;

/// How long to wait for output pipes to drain after the process is gone.
/// Grandchildren that inherited the pipes can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// How one stage execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    /// Exit code 0 and outputs persisted.
    Succeeded,
    NonZeroExit { code: i32 },
    /// Terminated by a signal not sent by us.
    Killed { signal: Option<i32> },
    /// Killed after exceeding the stage timeout.
    Timeout { after_ms: u64 },
    /// Killed (or never started) because the run was cancelled.
    Cancelled,
    /// The program could not be started.
    SpawnFailed { message: String },
    /// The previous stage has no output to consume.
    MissingInput { stage: Stage },
    /// The artifact store failed while staging inputs or persisting outputs.
    StorageUnavailable { message: String },
    /// The local staging area could not be prepared.
    Staging { message: String },
    /// The run directory already holds artifacts from another invocation.
    RunDirInUse,
    /// The site's task panicked; nothing after this stage was recorded.
    Panicked { message: String },
}

impl StageStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("ok"),
            Self::NonZeroExit { code } => write!(f, "exit {code}"),
            Self::Killed { signal: Some(sig) } => write!(f, "killed by signal {sig}"),
            Self::Killed { signal: None } => f.write_str("killed"),
            Self::Timeout { after_ms } => {
                write!(f, "timeout after {:?}", Duration::from_millis(*after_ms))
            }
            Self::Cancelled => f.write_str("cancelled"),
            Self::SpawnFailed { message } => write!(f, "spawn failed: {message}"),
            Self::MissingInput { stage } => write!(f, "no {stage} output to read"),
            Self::StorageUnavailable { message } => write!(f, "storage unavailable: {message}"),
            Self::Staging { message } => write!(f, "staging failed: {message}"),
            Self::RunDirInUse => f.write_str("run directory already holds artifacts"),
            Self::Panicked { message } => write!(f, "panicked: {message}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor contract
// ---------------------------------------------------------------------------

/// Everything needed to start one stage process.
#[derive(Debug, Clone)]
pub struct StageInvocation<'a> {
    pub site: &'a SiteId,
    pub stage: Stage,
    pub command: &'a StageCommand,
    /// Existing, writable directory for the stage's artifacts.
    pub output_dir: &'a Path,
    /// Prior stage's visible artifacts (parse/normalize only).
    pub input_dir: Option<&'a Path>,
    pub timeout: Duration,
}

/// Outcome of one process execution, before outputs are persisted.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub status: StageStatus,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    /// An outcome for an execution that produced no process output.
    pub fn bare(status: StageStatus, duration: Duration) -> Self {
        Self {
            status,
            duration,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Capability to run a stage implementation.
///
/// The pipeline is polymorphic over this trait only; what the program is
/// written in never matters.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, invocation: &StageInvocation<'_>, cancel: &CancelSignal)
    -> ExecOutcome;
}

// ---------------------------------------------------------------------------
// Process executor
// ---------------------------------------------------------------------------

/// Runs stage implementations as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

enum Ended {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl StageExecutor for ProcessExecutor {
    #[instrument(skip_all, fields(site = %invocation.site, stage = %invocation.stage))]
    async fn execute(
        &self,
        invocation: &StageInvocation<'_>,
        cancel: &CancelSignal,
    ) -> ExecOutcome {
        let start = Instant::now();
        let program = invocation.command.program();

        let mut command = Command::new(program);
        command.arg(invocation.output_dir);
        if let Some(input) = invocation.input_dir {
            command.arg(input);
        }
        command
            .args(invocation.command.trailing_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so timeout and cancellation reach grandchildren.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %program.display(), error = %e, "failed to start stage");
                return ExecOutcome::bare(
                    StageStatus::SpawnFailed {
                        message: format!("{}: {e}", program.display()),
                    },
                    start.elapsed(),
                );
            }
        };
        debug!(program = %program.display(), pid = ?child.id(), "stage started");

        let (stdout_tail, stdout_task) = capture(child.stdout.take());
        let (stderr_tail, stderr_task) = capture(child.stderr.take());

        let ended = tokio::select! {
            res = child.wait() => Ended::Exited(res),
            _ = tokio::time::sleep(invocation.timeout) => Ended::TimedOut,
            _ = cancel.cancelled() => Ended::Cancelled,
        };

        let status = match ended {
            Ended::Exited(Ok(status)) => exit_status(status),
            Ended::Exited(Err(e)) => StageStatus::SpawnFailed {
                message: format!("waiting for {}: {e}", program.display()),
            },
            Ended::TimedOut => {
                warn!(timeout = ?invocation.timeout, "stage timed out, terminating");
                terminate(&mut child).await;
                StageStatus::Timeout {
                    after_ms: u64::try_from(invocation.timeout.as_millis()).unwrap_or(u64::MAX),
                }
            }
            Ended::Cancelled => {
                debug!("run cancelled, terminating stage");
                terminate(&mut child).await;
                StageStatus::Cancelled
            }
        };
        let duration = start.elapsed();

        let stdout = drain(stdout_tail, stdout_task).await;
        let stderr = drain(stderr_tail, stderr_task).await;

        if !status.is_success() {
            debug!(%status, stderr = %stderr, "stage failed");
        }

        ExecOutcome {
            status,
            duration,
            stdout,
            stderr,
        }
    }
}

fn exit_status(status: std::process::ExitStatus) -> StageStatus {
    match status.code() {
        Some(0) => StageStatus::Succeeded,
        Some(code) => StageStatus::NonZeroExit { code },
        None => StageStatus::Killed {
            signal: signal_of(&status),
        },
    }
}

#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Kill the stage's whole process group, then the child itself.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // SAFETY: killpg only sends a signal; the group was created at spawn.
        if unsafe { libc::killpg(pid, libc::SIGKILL) } != 0 {
            debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill failed (process already gone?)");
    }
}

// ---------------------------------------------------------------------------
// Output capture
// ---------------------------------------------------------------------------

type Tail = Arc<Mutex<Vec<u8>>>;

/// Read a stream to the end in the background, keeping its last bytes.
fn capture<R>(reader: Option<R>) -> (Tail, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let tail = Tail::default();
    let task = reader.map(|mut reader| {
        let tail = tail.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => push_tail(&tail, &buf[..n]),
                }
            }
        })
    });
    (tail, task)
}

fn push_tail(tail: &Mutex<Vec<u8>>, chunk: &[u8]) {
    let Ok(mut buf) = tail.lock() else {
        return;
    };
    buf.extend_from_slice(chunk);
    if buf.len() > OUTPUT_TAIL_BYTES {
        let excess = buf.len() - OUTPUT_TAIL_BYTES;
        buf.drain(..excess);
    }
}

async fn drain(tail: Tail, task: Option<JoinHandle<()>>) -> String {
    if let Some(mut task) = task {
        if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
    let bytes = tail.lock().map(|buf| buf.to_vec()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}
