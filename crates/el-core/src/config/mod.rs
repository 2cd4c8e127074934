//! Configuration loading and validation for el-core.
//!
//! This module handles:
//! - Loading `config.toml` (collection budgets, helper command, paths, rules)
//! - Config resolution order (CLI > env > XDG > defaults)
//! - Semantic validation (non-zero quanta, ceilings above quanta, rule syntax)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default XDG config directory name.
const CONFIG_DIR_NAME: &str = "event_logger";

/// Config file name inside the config directory.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default artifact size cap (bytes) checked between catchers.
pub const DEFAULT_MAX_LOG_BYTES: u64 = 2 * 1024 * 1024;

/// Default pause after stopping a catcher so in-flight writes land.
pub const DEFAULT_STOP_QUANTUM_MS: u64 = 1000;

/// Default poll quantum of the stack helper wait loop.
pub const DEFAULT_STACK_POLL_QUANTUM_MS: u64 = 100;

/// Default ceiling of the stack helper wait loop.
pub const DEFAULT_STACK_TIMEOUT_MS: u64 = 10_000;

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Invalid TOML in config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Semantic validation failed: {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("Invalid rule for event {event:?}: {message}")]
    InvalidRule { event: String, message: String },
}

impl From<ConfigError> for el_common::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidRule { event, message } => {
                el_common::Error::InvalidRule { event, message }
            }
            other => el_common::Error::Config(other.to_string()),
        }
    }
}

/// Budgets for one collection task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Running byte total above which remaining catchers are skipped.
    pub max_log_bytes: u64,
    /// Pause after stopping the outgoing catcher before writing the trailer.
    pub stop_quantum_ms: u64,
    /// Wall-clock budget for the whole task, checked between catchers.
    /// Zero disables the check.
    pub task_timeout_ms: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            stop_quantum_ms: DEFAULT_STOP_QUANTUM_MS,
            task_timeout_ms: 0,
        }
    }
}

/// Stack helper process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Helper argv. `{pid}` is replaced with the target pid.
    pub command: Vec<String>,
    pub poll_quantum_ms: u64,
    pub timeout_ms: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "gdb".to_string(),
                "--batch".to_string(),
                "-nx".to_string(),
                "-ex".to_string(),
                "thread apply all bt".to_string(),
                "-p".to_string(),
                "{pid}".to_string(),
            ],
            poll_quantum_ms: DEFAULT_STACK_POLL_QUANTUM_MS,
            timeout_ms: DEFAULT_STACK_TIMEOUT_MS,
        }
    }
}

impl StackConfig {
    /// Render the helper argv for `pid`.
    pub fn argv_for(&self, pid: u32) -> Vec<String> {
        let pid = pid.to_string();
        self.command.iter().map(|arg| arg.replace("{pid}", &pid)).collect()
    }
}

/// Kernel and procfs locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the proc filesystem.
    pub proc_root: PathBuf,
    /// IPC transaction log of a process. `{pid}` is substituted.
    pub ipc_transaction_log: String,
    /// Kernel IPC debug files streamed by the raw dump catcher.
    pub raw_ipc_files: Vec<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            ipc_transaction_log: "/proc/transaction_proc".to_string(),
            raw_ipc_files: vec![
                PathBuf::from("/sys/kernel/debug/binder/state"),
                PathBuf::from("/sys/kernel/debug/binder/transactions"),
            ],
        }
    }
}

impl PathsConfig {
    /// Path of the IPC transaction log for `pid`.
    pub fn ipc_log_for(&self, pid: u32) -> PathBuf {
        PathBuf::from(self.ipc_transaction_log.replace("{pid}", &pid.to_string()))
    }
}

/// Artifact store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: PathBuf,
    /// Oldest artifacts beyond this count are deleted. Zero keeps everything.
    pub max_files: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(CONFIG_DIR_NAME)
                .join("logs"),
            max_files: 100,
        }
    }
}

/// Collection rule for one event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub event: String,
    /// Catcher command string, e.g. `c,m,s,pb:1`.
    pub command: String,
    /// Minimum seconds between runs for the same (event, pid).
    #[serde(default)]
    pub interval_secs: u64,
}

/// Complete event logger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub collection: CollectionConfig,
    pub stack: StackConfig,
    pub paths: PathsConfig,
    pub store: StoreConfig,
    /// Process names dumped by the `S` command.
    pub system_watch_list: Vec<String>,
    pub rules: Vec<Rule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collection: CollectionConfig::default(),
            stack: StackConfig::default(),
            paths: PathsConfig::default(),
            store: StoreConfig::default(),
            system_watch_list: vec![
                "systemd".to_string(),
                "systemd-journald".to_string(),
                "dbus-daemon".to_string(),
            ],
            rules: vec![
                Rule {
                    event: "THREAD_BLOCK_6S".to_string(),
                    command: "c,m,s,pb:1".to_string(),
                    interval_secs: 10,
                },
                Rule {
                    event: "APP_INPUT_BLOCK".to_string(),
                    command: "s,S,b,pb".to_string(),
                    interval_secs: 10,
                },
                Rule {
                    event: "SERVICE_TIMEOUT".to_string(),
                    command: "s,S,pb:-2".to_string(),
                    interval_secs: 60,
                },
            ],
        }
    }
}

impl Config {
    /// Look up the collection rule for an event name.
    pub fn rule_for(&self, event: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.event == event)
    }

    /// Check semantic constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.max_log_bytes == 0 {
            return Err(invalid("collection.max_log_bytes", "must be greater than 0"));
        }
        if self.stack.command.is_empty() || self.stack.command[0].trim().is_empty() {
            return Err(invalid("stack.command", "must name a helper program"));
        }
        if self.stack.poll_quantum_ms == 0 {
            return Err(invalid("stack.poll_quantum_ms", "must be greater than 0"));
        }
        if self.stack.timeout_ms < self.stack.poll_quantum_ms {
            return Err(invalid(
                "stack.timeout_ms",
                "must be at least stack.poll_quantum_ms",
            ));
        }
        if self.paths.ipc_transaction_log.trim().is_empty() {
            return Err(invalid("paths.ipc_transaction_log", "must not be empty"));
        }
        for rule in &self.rules {
            if rule.event.trim().is_empty() {
                return Err(invalid_rule(&rule.event, "event name must not be empty"));
            }
            if rule.command.split(',').all(|token| token.trim().is_empty()) {
                return Err(invalid_rule(&rule.event, "command has no catcher tokens"));
            }
        }
        Ok(())
    }
}

fn invalid_rule(event: &str, message: &str) -> ConfigError {
    ConfigError::InvalidRule {
        event: event.to_string(),
        message: message.to_string(),
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Configuration resolution options.
#[derive(Debug, Default)]
pub struct ConfigOptions {
    /// Explicit config file (highest priority).
    pub config_path: Option<PathBuf>,
}

/// Resolved configuration with provenance information.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: Config,
    /// Path the config was read from (None if using defaults).
    pub path: Option<PathBuf>,
}

/// Load configuration with the standard resolution order.
///
/// Resolution order (highest to lowest priority):
/// 1. Explicit CLI flag (via ConfigOptions)
/// 2. Environment variable (EL_CONFIG)
/// 3. XDG config home (~/.config/event_logger/config.toml)
/// 4. Built-in defaults
///
/// An explicit path that does not exist is an error; a missing XDG file is not.
pub fn load_config(options: &ConfigOptions) -> Result<ResolvedConfig, ConfigError> {
    let explicit = options
        .config_path
        .clone()
        .or_else(|| std::env::var("EL_CONFIG").ok().map(PathBuf::from));

    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::NotFound { path });
            }
            Some(path)
        }
        None => {
            let default_path = default_config_dir().join(CONFIG_FILE_NAME);
            default_path.exists().then_some(default_path)
        }
    };

    let config = match &path {
        Some(path) => load_config_from_file(path)?,
        None => Config::default(),
    };
    config.validate()?;

    Ok(ResolvedConfig { config, path })
}

/// Parse and validate a config file.
pub fn load_config_from_file(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(config)
}

fn default_config_dir() -> PathBuf {
    let xdg_config = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
        });

    xdg_config.join(CONFIG_DIR_NAME)
}
