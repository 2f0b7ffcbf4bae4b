//! TOML-based configuration.
//!
//! Supports a config file (taskmill.toml) with environment variable
//! expansion.
//!
//! Example configuration:
//! ```toml
//! [tasks]
//! max_concurrent = 8
//! default_queue_capacity = 65536
//! exec_timeout_ms = 0
//!
//! [worker]
//! command = "${TASKMILL_WORKER_BIN}"
//! args = ["--log-level", "info"]
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Task admission and queue limits.
    pub tasks: TaskSettings,

    /// Worker process configuration.
    pub worker: WorkerSettings,
}

/// Task limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskSettings {
    /// Maximum number of concurrently registered tasks per session.
    pub max_concurrent: usize,

    /// Result queue capacity used when the caller does not pass one.
    pub default_queue_capacity: u32,

    /// Largest result queue a caller may request.
    pub max_queue_capacity: u32,

    /// Largest request payload accepted, in bytes.
    pub max_request_size: usize,

    /// Per-task execution timeout in milliseconds; zero disables it.
    pub exec_timeout_ms: u32,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            default_queue_capacity: 64 * 1024,
            max_queue_capacity: 16 * 1024 * 1024,
            max_request_size: 4 * 1024 * 1024,
            exec_timeout_ms: 0,
        }
    }
}

/// Worker process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker binary to launch (supports ${ENV_VAR} expansion).
    pub command: String,

    /// Extra arguments passed before the channel name.
    pub args: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            command: "taskmill-worker".to_string(),
            args: Vec::new(),
        }
    }
}

impl WorkerSettings {
    /// Get the worker command with environment variables expanded.
    pub fn resolved_command(&self) -> Result<String, SettingsError> {
        expand_env_vars(&self.command)
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `TASKMILL_CONFIG`
    /// 2. `./taskmill.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("TASKMILL_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("taskmill.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        Ok(Settings::default())
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.tasks.max_concurrent == 0 {
            return Err(SettingsError::InvalidConfig(
                "tasks.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.tasks.default_queue_capacity > self.tasks.max_queue_capacity {
            return Err(SettingsError::InvalidConfig(
                "tasks.default_queue_capacity exceeds tasks.max_queue_capacity".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' {
            // Check for ${VAR} or $VAR
            if chars.peek() == Some(&'{') {
                chars.next(); // consume '{'
                let mut var_name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch == '}' {
                        chars.next(); // consume '}'
                        break;
                    }
                    var_name.push(chars.next().unwrap());
                }
                let value = env::var(&var_name)
                    .map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
                result.push_str(&value);
            } else {
                // $VAR (ends at non-alphanumeric/underscore)
                let mut var_name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        var_name.push(chars.next().unwrap());
                    } else {
                        break;
                    }
                }
                if var_name.is_empty() {
                    // Just a lone $, keep it
                    result.push('$');
                } else {
                    let value = env::var(&var_name)
                        .map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
                    result.push_str(&value);
                }
            }
        } else {
            result.push(c);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_braces() {
        env::set_var("TEST_VAR", "hello");
        assert_eq!(expand_env_vars("${TEST_VAR}").unwrap(), "hello");
        assert_eq!(
            expand_env_vars("prefix_${TEST_VAR}_suffix").unwrap(),
            "prefix_hello_suffix"
        );
        env::remove_var("TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_no_braces() {
        env::set_var("TEST_VAR2", "world");
        assert_eq!(expand_env_vars("$TEST_VAR2").unwrap(), "world");
        assert_eq!(expand_env_vars("$TEST_VAR2!").unwrap(), "world!");
        env::remove_var("TEST_VAR2");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("${NONEXISTENT_VAR_12345}");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[tasks]
max_concurrent = 4
default_queue_capacity = 8192
exec_timeout_ms = 30000

[worker]
command = "/usr/local/bin/taskmill-worker"
args = ["--quiet"]
"#;

        let settings: Settings = toml::from_str(toml).unwrap();

        assert_eq!(settings.tasks.max_concurrent, 4);
        assert_eq!(settings.tasks.default_queue_capacity, 8192);
        assert_eq!(settings.tasks.exec_timeout_ms, 30000);
        assert_eq!(settings.worker.command, "/usr/local/bin/taskmill-worker");
        assert_eq!(settings.worker.args, vec!["--quiet".to_string()]);
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();

        assert_eq!(settings.tasks.max_concurrent, 8);
        assert_eq!(settings.tasks.default_queue_capacity, 64 * 1024);
        assert_eq!(settings.tasks.max_queue_capacity, 16 * 1024 * 1024);
        assert_eq!(settings.tasks.max_request_size, 4 * 1024 * 1024);
        assert_eq!(settings.tasks.exec_timeout_ms, 0);
        assert_eq!(settings.worker.command, "taskmill-worker");
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let settings: Settings = toml::from_str("[tasks]\nmax_concurrent = 0\n").unwrap();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidConfig(_))
        ));
    }
}
