//! taskctx configuration system
//!
//! Runtime settings loaded from a TOML file, with defaults for every key.
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. Environment variables (TASKCTX_WORKERS, TASKCTX_LOG)
//! 3. Config file (--config, or ~/.config/taskctx/config.toml)
//! 4. Default values
//! ```
//!
//! # Example file
//!
//! ```toml
//! [scheduler]
//! workers = 4
//! idle_timeout_ms = 10
//! stall_timeout_ms = 500
//!
//! [log]
//! level = "debug"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::scheduler::SchedulerConfig;
use crate::util::logger::LogLevel;

/// Environment variable overriding `scheduler.workers`.
pub const ENV_WORKERS: &str = "TASKCTX_WORKERS";
/// Environment variable overriding `log.level`.
pub const ENV_LOG: &str = "TASKCTX_LOG";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuntimeConfig {
    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Logging settings
    #[serde(default)]
    pub log: LogSection,
}

/// `[scheduler]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSection {
    /// Pool size; defaults to the number of CPUs
    #[serde(default)]
    pub workers: Option<usize>,
    /// Idle wait before re-checking shutdown
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Enables the stall detector when set
    #[serde(default)]
    pub stall_timeout_ms: Option<u64>,
    /// Stall detector scan interval
    #[serde(default = "default_stall_poll_interval_ms")]
    pub stall_poll_interval_ms: u64,
    /// Thread name prefix
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_idle_timeout_ms() -> u64 {
    10
}

fn default_stall_poll_interval_ms() -> u64 {
    50
}

fn default_thread_name_prefix() -> String {
    "taskctx".to_string()
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            workers: None,
            idle_timeout_ms: default_idle_timeout_ms(),
            stall_timeout_ms: None,
            stall_poll_interval_ms: default_stall_poll_interval_ms(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

/// `[log]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogSection {
    /// trace | debug | info | warn | error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RuntimeConfig {
    /// Build the scheduler configuration, validating values.
    pub fn scheduler_config(&self) -> Result<SchedulerConfig, ConfigError> {
        let section = &self.scheduler;
        let defaults = SchedulerConfig::default();

        let num_workers = section.workers.unwrap_or(defaults.num_workers);
        if num_workers == 0 {
            return Err(ConfigError::Invalid("scheduler.workers must be at least 1".to_string()));
        }
        if section.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.idle_timeout_ms must be at least 1".to_string(),
            ));
        }
        if section.stall_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.stall_poll_interval_ms must be at least 1".to_string(),
            ));
        }

        Ok(SchedulerConfig {
            num_workers,
            idle_timeout: Duration::from_millis(section.idle_timeout_ms),
            stall_timeout: section.stall_timeout_ms.map(Duration::from_millis),
            stall_poll_interval: Duration::from_millis(section.stall_poll_interval_ms),
            thread_name_prefix: section.thread_name_prefix.clone(),
        })
    }

    /// Parse the configured log level.
    pub fn log_level(&self) -> Result<LogLevel, ConfigError> {
        self.log.level.parse().map_err(ConfigError::Invalid)
    }

    /// Apply environment overrides from an iterator of `(key, value)` pairs.
    pub fn apply_env<I, K, V>(
        &mut self,
        vars: I,
    ) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            match key.as_ref() {
                ENV_WORKERS => {
                    let workers = value.as_ref().trim().parse::<usize>().map_err(|e| {
                        ConfigError::Invalid(format!("{}='{}': {}", ENV_WORKERS, value.as_ref(), e))
                    })?;
                    self.scheduler.workers = Some(workers);
                },
                ENV_LOG => self.log.level = value.as_ref().to_string(),
                _ => {},
            }
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env(std::env::vars())
    }
}

/// Get the user config directory
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config).join("taskctx"));
    }

    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".config").join("taskctx"));
    }

    if let Ok(appdata) = std::env::var("APPDATA") {
        return Some(PathBuf::from(appdata).join("taskctx"));
    }

    None
}

/// Get the user config file path (~/.config/taskctx/config.toml)
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.toml"))
}

/// Parse configuration from TOML text
pub fn load_config_str(content: &str) -> Result<RuntimeConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Load configuration from a file
pub fn load_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_config_str(&content)
}

/// Load the user-level config; defaults when the file does not exist
pub fn load_user_config() -> Result<RuntimeConfig, ConfigError> {
    match get_config_path() {
        Some(path) if path.exists() => load_config(&path),
        _ => Ok(RuntimeConfig::default()),
    }
}

/// Save configuration to a file
pub fn save_config(
    config: &RuntimeConfig,
    path: &Path,
) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the file failed
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serialization failed
    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}
