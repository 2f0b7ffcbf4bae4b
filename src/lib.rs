//! # Taskmill
//!
//! Out-of-process task execution over shared-memory channels.
//!
//! ## Architecture
//!
//! A controller process launches one worker process per task. The two
//! sides share exactly one memory region per task:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Controller (session)                    │
//! │   launch / result / cancel / wait / detach / progress    │
//! └─────────────────────────────────────────────────────────┘
//!          │ creates                          ▲ decodes
//!          ▼                                  │ [protocol]
//! ┌─────────────────────────────────────────────────────────┐
//! │              Shared-memory channel [shm]                 │
//! │   control block │ request payload │ bounded result ring  │
//! └─────────────────────────────────────────────────────────┘
//!          ▲ attaches by name                 │ encodes
//!          │                                  ▼ [protocol]
//! ┌─────────────────────────────────────────────────────────┐
//! │                Worker process [worker]                   │
//! │        shim + TaskRunner, one task per process           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Tasks are addressed by worker pid, optionally fenced by an access
//! cookie minted at launch so a reused pid can never be mistaken for the
//! task that owned it first.

pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod shm;
pub mod supervisor;
pub mod worker;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::controller::{
        Controller, LaunchOptions, ResultSet, TaskInfo, TaskState, TaskStatus,
    };
    pub use crate::error::{TaskError, TaskResult};
    pub use crate::identity::{IdentityProvider, Principal, SessionIdentity};
    pub use crate::protocol::{ColumnType, Value};
    pub use crate::shm::Progress;
    pub use crate::supervisor::{ProcessSupervisor, TokioSupervisor};
}

pub use controller::{Controller, LaunchOptions, ResultSet, TaskState, TaskStatus};
pub use error::{TaskError, TaskResult};
