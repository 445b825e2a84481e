// ABOUTME: OS-process half of a worker: spawn, exit watching and termination
//
// Spawns a worker subprocess with piped stdin/stdout, hands the pipes to the
// caller and moves the Child into a watcher task that publishes exit status
// through a watch channel. Termination is SIGTERM, a grace period, then SIGKILL.

// Allow if-let/else patterns instead of map_or_else for readability
#![allow(clippy::option_if_let_else)]

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Errors that can occur while launching a process
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Process spawn failed
    #[error("Failed to spawn process '{command}': {source}")]
    SpawnFailed {
        /// Executable that failed to launch
        command: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Invalid command
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The child came up without the pipes we asked for
    #[error("Process {0} is missing a stdio pipe")]
    MissingPipe(u32),
}

/// Current state of a worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is running with the given PID
    Running {
        /// Process ID
        pid: u32,
    },

    /// Process exited normally with exit code
    Exited {
        /// Exit code from the process
        code: i32,
    },

    /// Process was terminated by a signal
    Signaled {
        /// Signal number that terminated the process
        signal: i32,
    },

    /// Waiting on the process failed
    Failed {
        /// Description of the failure
        reason: String,
    },
}

impl ProcessState {
    /// Returns true if the process is currently running
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    fn from_exit_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited { code };
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled { signal };
            }
        }

        Self::Failed {
            reason: "Unknown termination".to_string(),
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running { pid } => write!(f, "running (pid {pid})"),
            Self::Exited { code } => write!(f, "exit code {code}"),
            Self::Signaled { signal } => write!(f, "signal {signal}"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Everything needed to launch one worker process
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Executable
    pub command: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Working directory
    pub cwd: Option<PathBuf>,
}

/// A freshly spawned process with its pipes split off
pub struct SpawnedProcess {
    /// Process ID
    pub pid: u32,
    /// Write side of the worker's stdin
    pub stdin: ChildStdin,
    /// Read side of the worker's stdout
    pub stdout: ChildStdout,
    /// Exit watcher and termination control
    pub monitor: ProcessMonitor,
}

/// Observes and controls a process owned by a background watcher task
#[derive(Debug)]
pub struct ProcessMonitor {
    pid: u32,
    state_rx: watch::Receiver<ProcessState>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// Spawn a process and start its exit watcher
///
/// Must be called from within a tokio runtime.
pub fn spawn_process(spec: &LaunchSpec) -> Result<SpawnedProcess, ProcessError> {
    if spec.command.trim().is_empty() {
        return Err(ProcessError::InvalidCommand(
            "Command cannot be empty".to_string(),
        ));
    }

    debug!(command = %spec.command, args = ?spec.args, "Spawning worker process");

    let mut process_cmd = Command::new(&spec.command);
    process_cmd
        .args(&spec.args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true);

    for (key, value) in &spec.env {
        process_cmd.env(key, value);
    }

    if let Some(dir) = &spec.cwd {
        process_cmd.current_dir(dir);
    }

    let mut child = process_cmd
        .spawn()
        .map_err(|source| ProcessError::SpawnFailed {
            command: spec.command.clone(),
            source,
        })?;

    let pid = child.id().unwrap_or(0);
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.start_kill();
        return Err(ProcessError::MissingPipe(pid));
    };

    info!(pid = pid, command = %spec.command, "Worker process spawned");

    let (state_tx, state_rx) = watch::channel(ProcessState::Running { pid });
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                if let Err(e) = child.start_kill() {
                    warn!(pid = pid, error = %e, "Failed to send SIGKILL");
                }
                child.wait().await
            }
        };

        let state = match status {
            Ok(status) => ProcessState::from_exit_status(status),
            Err(e) => ProcessState::Failed {
                reason: format!("Status check failed: {e}"),
            },
        };
        debug!(pid = pid, state = %state, "Worker process exited");
        let _ = state_tx.send(state);
    });

    Ok(SpawnedProcess {
        pid,
        stdin,
        stdout,
        monitor: ProcessMonitor {
            pid,
            state_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
        },
    })
}

impl ProcessMonitor {
    /// Process ID
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Latest known state
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state_rx.borrow().clone()
    }

    /// Whether the process is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state_rx.borrow().is_running()
    }

    /// A receiver that observes every state change of this process
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    /// Wait until the process has exited
    pub async fn wait(&self) -> ProcessState {
        let mut rx = self.state_rx.clone();
        let state = match rx.wait_for(|state| !state.is_running()).await {
            Ok(state) => state.clone(),
            // Watcher gone without reporting; treat whatever we saw last as final
            Err(_) => self.state(),
        };
        state
    }

    /// Ask the watcher task to SIGKILL the process
    pub fn force_kill(&self) {
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    /// Gracefully terminate the process
    ///
    /// First sends SIGTERM, waits up to `grace`, then sends SIGKILL if the
    /// process hasn't exited.
    pub async fn terminate(&self, grace: Duration) -> ProcessState {
        if !self.is_running() {
            return self.state();
        }

        info!(pid = self.pid, "Terminating worker process");

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Ok(raw) = i32::try_from(self.pid) {
                if raw > 0 {
                    let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
                }
            }
        }

        #[cfg(not(unix))]
        {
            self.force_kill();
        }

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(state) => {
                debug!(pid = self.pid, state = %state, "Process terminated gracefully");
                state
            }
            Err(_) => {
                warn!(
                    pid = self.pid,
                    "Process did not terminate gracefully, sending SIGKILL"
                );
                self.force_kill();
                self.wait().await
            }
        }
    }
}
