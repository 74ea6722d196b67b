use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            logging: LoggingConfig::default(),
            plugins: PluginsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    /// Mirror log lines to the console (stderr).
    #[serde(default = "default_stdout_enabled")]
    pub stdout: bool,
    /// Write a daily-rolling log file under the log directory.
    #[serde(default = "default_file_enabled")]
    pub file: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            stdout: default_stdout_enabled(),
            file: default_file_enabled(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Plugin discovery and IPC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Overrides the system-wide plugin directory.
    #[serde(default)]
    pub system_dir: Option<PathBuf>,
    /// Overrides the per-user plugin directory.
    #[serde(default)]
    pub user_dir: Option<PathBuf>,
    /// How long a dispatch waits for a plugin's reply.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// How long shutdown waits for plugins to exit before killing them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            system_dir: None,
            user_dir: None,
            response_timeout_ms: default_response_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl PluginsConfig {
    /// Directories to scan, in precedence order: system first, then user.
    pub fn directories(&self, dirs: &AppDirs) -> Vec<PathBuf> {
        let system = self
            .system_dir
            .as_deref()
            .map(|p| dirs.expand_home(p))
            .unwrap_or_else(|| dirs.system_plugin_dir().to_path_buf());
        let user = self
            .user_dir
            .as_deref()
            .map(|p| dirs.expand_home(p))
            .unwrap_or_else(|| dirs.user_plugin_dir().to_path_buf());
        vec![system, user]
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("plugins.{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        if self.plugins.response_timeout_ms == 0 {
            return Err(ValidationError::ZeroDuration {
                field: "response_timeout_ms",
            });
        }
        if self.plugins.shutdown_grace_ms == 0 {
            return Err(ValidationError::ZeroDuration {
                field: "shutdown_grace_ms",
            });
        }
        Ok(())
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_stdout_enabled() -> bool {
    true
}

fn default_file_enabled() -> bool {
    true
}

fn default_response_timeout_ms() -> u64 {
    2000
}

fn default_shutdown_grace_ms() -> u64 {
    500
}
