//! Worker supervisor - owns the worker subprocess.
//!
//! One long-lived worker per adapter: its stdin is a line sink, stdout and stderr
//! are [`FrameReader`]s, and its exit is observed by a background task that
//! publishes a [`WorkerState`]. The worker is never respawned; once it reaches a
//! terminal state the adapter shuts down.
//!
//! Stdin is fed by a writer task through a bounded queue. Callers never wait on the
//! pipe: a worker that stops reading shows up as a full queue, which is a failure.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::ipc::{FrameReader, LineCodec, frame_reader};

/// Lines that may wait for the worker's stdin before writes start failing.
pub const STDIN_QUEUE_CAPACITY: usize = 256;

/// Program, arguments and extra environment for the worker.
///
/// The worker inherits the adapter's environment; `env` entries are added on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Split a command line on whitespace. No shell quoting is interpreted.
    pub fn parse(command_line: &str) -> Result<Self, SpawnError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(SpawnError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
            env: Vec::new(),
        })
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("worker command is empty")]
    EmptyCommand,
    #[error("failed to launch worker {program:?}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("worker {0} was not captured")]
    MissingPipe(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker is not reading stdin ({0} lines queued)")]
    Backlog(usize),
    #[error("worker stdin is closed")]
    Closed,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError>;
}

/// Spawns the command directly with all three standard streams piped.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError> {
        Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                program: command.program.clone(),
                source,
            })
    }
}

/// How the worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running { pid: Option<u32> },
    Exited(ExitInfo),
    Failed(String),
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Failed(_))
    }
}

/// Owner of the single worker process.
pub struct WorkerSupervisor {
    pid: Option<u32>,
    stdin: Option<mpsc::Sender<String>>,
    stdout: Option<FrameReader<ChildStdout>>,
    stderr: Option<FrameReader<ChildStderr>>,
    state_tx: Arc<watch::Sender<WorkerState>>,
    state_rx: watch::Receiver<WorkerState>,
    terminate: CancellationToken,
}

impl WorkerSupervisor {
    /// Launch the worker and start watching for its exit.
    ///
    /// `grace` bounds how long [`terminate`](Self::terminate) waits after SIGTERM
    /// before killing the process.
    pub fn start(
        spawner: &dyn WorkerSpawner,
        command: &WorkerCommand,
        grace: Duration,
    ) -> Result<Self, SpawnError> {
        let (state_tx, state_rx) = watch::channel(WorkerState::Starting);

        tracing::info!(program = %command.program, args = ?command.args, "Spawning worker");
        let mut child = spawner.spawn(command)?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

        let pid = child.id();
        state_tx.send_replace(WorkerState::Running { pid });
        tracing::info!(pid = ?pid, "Worker running");

        let state_tx = Arc::new(state_tx);
        let terminate = CancellationToken::new();
        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE_CAPACITY);
        tokio::spawn(write_stdin(
            stdin,
            stdin_rx,
            Arc::clone(&state_tx),
            terminate.clone(),
        ));
        tokio::spawn(supervise(
            child,
            Arc::clone(&state_tx),
            terminate.clone(),
            grace,
        ));

        Ok(Self {
            pid,
            stdin: Some(stdin_tx),
            stdout: Some(frame_reader(stdout)),
            stderr: Some(frame_reader(stderr)),
            state_tx,
            state_rx,
            terminate,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state_rx.borrow().clone()
    }

    /// Queue one line for the worker's stdin. Never waits.
    ///
    /// A full queue marks the worker `Failed`, as does a pipe error in the writer
    /// task; the caller treats either like an exit.
    pub fn write_line(&self, line: &str) -> Result<(), WorkerError> {
        let Some(stdin) = self.stdin.as_ref() else {
            return Err(WorkerError::Closed);
        };
        match stdin.try_send(line.to_string()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let err = WorkerError::Backlog(STDIN_QUEUE_CAPACITY);
                tracing::error!(error = %err, "Worker stdin backlog full");
                mark_terminal(&self.state_tx, WorkerState::Failed(err.to_string()));
                Err(err)
            }
            Err(TrySendError::Closed(_)) => Err(WorkerError::Closed),
        }
    }

    /// Worker stdout as lines. Can be taken once.
    pub fn take_stdout_lines(&mut self) -> Option<FrameReader<ChildStdout>> {
        self.stdout.take()
    }

    /// Worker stderr as lines. Can be taken once.
    pub fn take_stderr_lines(&mut self) -> Option<FrameReader<ChildStderr>> {
        self.stderr.take()
    }

    /// Subscribe to state changes.
    pub fn state_changes(&self) -> watch::Receiver<WorkerState> {
        self.state_rx.clone()
    }

    /// Resolves with the terminal state once the worker has exited or failed.
    pub async fn exited(&self) -> WorkerState {
        wait_terminal(self.state_rx.clone()).await
    }

    /// Run `callback` with the exit status once the worker has ended.
    ///
    /// A worker that failed without an exit status reports `(None, None)`.
    pub fn on_exit<F>(&self, callback: F)
    where
        F: FnOnce(ExitInfo) + Send + 'static,
    {
        let rx = self.state_rx.clone();
        tokio::spawn(async move {
            let info = match wait_terminal(rx).await {
                WorkerState::Exited(info) => info,
                _ => ExitInfo {
                    code: None,
                    signal: None,
                },
            };
            callback(info);
        });
    }

    /// Close stdin and ask the worker to stop: SIGTERM, then kill after the grace delay.
    pub fn terminate(&mut self) {
        self.stdin = None;
        self.terminate.cancel();
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        self.terminate.cancel();
    }
}

async fn wait_terminal(mut rx: watch::Receiver<WorkerState>) -> WorkerState {
    if let Ok(state) = rx.wait_for(WorkerState::is_terminal).await {
        return state.clone();
    }
    rx.borrow().clone()
}

/// Move to a terminal state unless one was already recorded.
fn mark_terminal(state_tx: &watch::Sender<WorkerState>, next: WorkerState) {
    state_tx.send_if_modified(|state| {
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    });
}

/// Drain queued lines into the worker's stdin. Dropping the sink closes the pipe.
async fn write_stdin(
    stdin: ChildStdin,
    mut lines: mpsc::Receiver<String>,
    state_tx: Arc<watch::Sender<WorkerState>>,
    terminate: CancellationToken,
) {
    let mut sink = FramedWrite::new(stdin, LineCodec::new());
    loop {
        let line = tokio::select! {
            _ = terminate.cancelled() => break,
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let written = tokio::select! {
            _ = terminate.cancelled() => break,
            written = sink.send(line) => written,
        };
        if let Err(e) = written {
            tracing::error!(error = %e, "Worker stdin write failed");
            mark_terminal(&state_tx, WorkerState::Failed(format!("stdin write failed: {e}")));
            break;
        }
    }
}

async fn supervise(
    mut child: Child,
    state_tx: Arc<watch::Sender<WorkerState>>,
    terminate: CancellationToken,
    grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = terminate.cancelled() => {
            request_stop(&mut child);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(grace_ms = grace.as_millis() as u64, "Worker ignored SIGTERM, killing");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(error = %e, "Failed to kill worker");
                    }
                    child.wait().await
                }
            }
        }
    };

    let next = match status {
        Ok(status) => {
            let info = ExitInfo::from(status);
            tracing::info!(code = ?info.code, signal = ?info.signal, "Worker exited");
            WorkerState::Exited(info)
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to wait for worker");
            WorkerState::Failed(e.to_string())
        }
    };
    mark_terminal(&state_tx, next);
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    tracing::debug!(pid, "Sending SIGTERM to worker");
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "Failed to signal worker");
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to kill worker");
    }
}
