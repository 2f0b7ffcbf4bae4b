//! Configuration module.
//!
//! Handles settings files, defaults and environment variable expansion.

mod settings;

pub use settings::{
    expand_env_vars, Settings, SettingsError, TaskSettings, WorkerSettings,
};
