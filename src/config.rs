//! Configuration file support for leadflow
//!
//! Reads from .leadflow/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Assignment deadlines
    #[serde(default)]
    pub sla: SlaConfig,

    /// Background sweep cadence and batch sizes
    #[serde(default)]
    pub sweeps: SweepConfig,

    /// Retry budget for contended transactions
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hours a manager has to act before the deadline sweep takes the lead away
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SlaConfig {
    /// First assignment after submission
    /// Default: 15
    #[serde(default = "default_initial_hours")]
    pub initial_hours: i64,

    /// Any assignment made by the deadline sweep or an admin
    /// Default: 4
    #[serde(default = "default_short_hours")]
    pub followup_hours: i64,

    /// Assignment opened when an accepted lead is reverted
    /// Default: 4
    #[serde(default = "default_short_hours")]
    pub revert_hours: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SweepConfig {
    #[serde(default = "default_deadline_interval")]
    pub deadline_interval_mins: u64,

    #[serde(default = "default_deadline_batch")]
    pub deadline_batch: i64,

    #[serde(default = "default_reminder_interval")]
    pub reminder_interval_mins: u64,

    #[serde(default = "default_reminder_batch")]
    pub reminder_batch: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// How long SQLite waits on a lock before reporting it busy
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Folder for attachments when no cloud store is configured
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// tracing EnvFilter directive, overridden by RUST_LOG
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_initial_hours() -> i64 {
    15
}

fn default_short_hours() -> i64 {
    4
}

fn default_deadline_interval() -> u64 {
    30
}

fn default_deadline_batch() -> i64 {
    10
}

fn default_reminder_interval() -> u64 {
    60
}

fn default_reminder_batch() -> i64 {
    20
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_busy_timeout_ms() -> u64 {
    250
}

fn default_pool_size() -> u32 {
    8
}

fn default_port() -> u16 {
    5000
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from(".leadflow/uploads")
}

fn default_log_filter() -> String {
    "leadflow=info".to_string()
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            initial_hours: default_initial_hours(),
            followup_hours: default_short_hours(),
            revert_hours: default_short_hours(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            deadline_interval_mins: default_deadline_interval(),
            deadline_batch: default_deadline_batch(),
            reminder_interval_mins: default_reminder_interval(),
            reminder_batch: default_reminder_batch(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Load config from .leadflow/config.toml
    /// Returns default config if file doesn't exist
    pub fn load() -> Self {
        if let Some(path) = Self::find_config_path() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => eprintln!("Ignoring invalid {}: {}", path.display(), e),
                }
            }
        }
        Self::default()
    }

    /// Find config.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(".leadflow").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    /// Rendered default config, written by `leadflow init`
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}
