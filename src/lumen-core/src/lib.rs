pub mod config;
pub mod logging;
pub mod paths;

pub use config::{Config, ConfigError, LogLevel, LoggingConfig, PluginsConfig, ValidationError};
pub use logging::{init_logging, init_stderr_logging, LoggingError, LoggingGuard};
pub use paths::{AppDirs, DirsError};

pub const APP_NAME: &str = "lumen";
pub const APP_AUTHOR: &str = "Lumen";
pub const APP_QUALIFIER: &str = "io";

/// System-wide plugin directory, scanned before the user's directory.
pub const SYSTEM_PLUGIN_DIR: &str = "/usr/lib/lumen/launcher";
