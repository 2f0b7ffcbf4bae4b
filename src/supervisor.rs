//! Worker process supervision.
//!
//! The controller never spawns processes directly; it goes through a
//! [`ProcessSupervisor`] so tests can stand in a thread-backed fake. The
//! production implementation launches the configured worker binary with
//! the channel name on its command line.

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::{SettingsError, WorkerSettings};
use crate::error::{TaskError, TaskResult};

/// Observed state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Stopped,
    /// The supervisor can no longer say; treated as stopped by callers
    /// that are deciding whether to keep waiting.
    Unknown,
}

/// Handle to one spawned worker.
pub trait WorkerHandle: Send {
    /// Operating-system process id of the worker.
    fn pid(&self) -> u32;

    /// Poll the worker's state without blocking.
    fn status(&mut self) -> WorkerStatus;

    /// Ask the worker to stop at its next safe point (SIGINT).
    fn stop_graceful(&mut self);

    /// Demand termination (SIGTERM). The worker may still run briefly.
    fn stop_forceful(&mut self);
}

/// Starts worker processes attached to a named channel.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn start(&self, channel: &str) -> TaskResult<Box<dyn WorkerHandle>>;
}

/// Production supervisor backed by `tokio::process`.
pub struct TokioSupervisor {
    command: String,
    args: Vec<String>,
}

impl TokioSupervisor {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Build from the `[worker]` settings section, expanding environment
    /// variables in the command.
    pub fn from_settings(settings: &WorkerSettings) -> Result<Self, SettingsError> {
        Ok(Self {
            command: settings.resolved_command()?,
            args: settings.args.clone(),
        })
    }
}

#[async_trait]
impl ProcessSupervisor for TokioSupervisor {
    async fn start(&self, channel: &str) -> TaskResult<Box<dyn WorkerHandle>> {
        let child = Command::new(&self.command)
            .args(&self.args)
            .arg("--channel")
            .arg(channel)
            // Detaching from a task must never take the worker down with it;
            // the worker exits on its own once it detaches from the channel.
            .kill_on_drop(false)
            .spawn()
            .map_err(TaskError::SpawnFailed)?;

        let pid = child.id().ok_or_else(|| {
            TaskError::SpawnFailed(std::io::Error::other("worker exited before reporting a pid"))
        })?;
        debug!(pid, channel, command = %self.command, "started worker");
        Ok(Box::new(ChildHandle { pid, child }))
    }
}

struct ChildHandle {
    pid: u32,
    child: Child,
}

impl ChildHandle {
    fn signal(&self, sig: libc::c_int) {
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, sig) };
        if rc != 0 {
            // ESRCH after exit is the normal case; anything else is worth a line.
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(pid = self.pid, sig, %err, "failed to signal worker");
            }
        }
    }
}

impl WorkerHandle for ChildHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn status(&mut self) -> WorkerStatus {
        match self.child.try_wait() {
            Ok(None) => WorkerStatus::Running,
            Ok(Some(_)) => WorkerStatus::Stopped,
            Err(err) => {
                warn!(pid = self.pid, %err, "could not poll worker status");
                WorkerStatus::Unknown
            }
        }
    }

    fn stop_graceful(&mut self) {
        self.signal(libc::SIGINT);
    }

    fn stop_forceful(&mut self) {
        self.signal(libc::SIGTERM);
    }
}
