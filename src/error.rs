//! Crate-wide error types.

use std::io;
use thiserror::Error;

use crate::shm::ShmError;

/// Result type for task operations.
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors raised by the controller-side API.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Bad request or queue parameters (empty request, size out of bounds).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Admission limit reached, or a worker could not be started.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unknown task id, or cookie mismatch. Both cases surface identically
    /// so a caller cannot probe which one applied.
    #[error("PID {pid} is not attached to this session")]
    NotFound {
        /// The process id that was looked up.
        pid: u32,
    },

    /// Caller lacks the privileges of the task's owner.
    #[error("permission denied for background worker with PID {pid}")]
    PermissionDenied {
        /// The process id of the task.
        pid: u32,
    },

    /// The result stream was requested a second time.
    #[error("results for PID {pid} have already been consumed")]
    AlreadyConsumed {
        /// The process id of the task.
        pid: u32,
    },

    /// Operation not available for this task (e.g. result retrieval on a
    /// fire-and-forget submission).
    #[error("feature disabled: {0}")]
    FeatureDisabled(String),

    /// Malformed frame, schema/row shape mismatch, or a disallowed frame
    /// type on the result stream.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The worker vanished before a terminal frame was observed.
    #[error("lost connection to worker process with PID {pid}")]
    ConnectionLost {
        /// The process id of the task.
        pid: u32,
    },

    /// The worker's task runner itself failed; carries the worker's
    /// structured error.
    #[error("worker error from PID {pid}: {message} (code: {code})")]
    Remote {
        /// The process id of the originating task.
        pid: u32,
        /// Error code reported by the worker.
        code: String,
        /// Primary error message.
        message: String,
        /// Optional detail text.
        detail: Option<String>,
        /// Optional hint text.
        hint: Option<String>,
    },

    /// Two live tasks claimed the same process id under different owners.
    #[error("background worker with PID {pid} already exists")]
    IntegrityViolation {
        /// The contested process id.
        pid: u32,
    },

    /// Shared-memory transport failure.
    #[error("channel error: {0}")]
    Channel(#[from] ShmError),

    /// Failed to spawn the worker process.
    #[error("failed to start worker process: {0}")]
    SpawnFailed(#[source] io::Error),
}

impl TaskError {
    /// Build a `Remote` error from decoded wire fields.
    pub fn remote(pid: u32, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            pid,
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    /// Whether this error terminates only the task it belongs to, never the
    /// controller process.
    pub fn is_task_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::ConnectionLost { .. } | Self::Remote { .. }
        )
    }
}
