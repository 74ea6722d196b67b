use crate::{APP_AUTHOR, APP_NAME, APP_QUALIFIER, SYSTEM_PLUGIN_DIR};
use directories::{BaseDirs, ProjectDirs};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AppDirs {
    config_dir: PathBuf,
    data_dir: PathBuf,
    log_dir: PathBuf,
    home_dir: PathBuf,
    system_plugin_dir: PathBuf,
    user_plugin_dir: PathBuf,
}

impl AppDirs {
    pub fn discover() -> Result<Self, DirsError> {
        let dirs = ProjectDirs::from(APP_QUALIFIER, APP_AUTHOR, APP_NAME)
            .ok_or(DirsError::MissingProjectDirs)?;
        let base = BaseDirs::new().ok_or(DirsError::MissingHomeDir)?;
        Ok(Self {
            config_dir: dirs.config_dir().to_path_buf(),
            data_dir: dirs.data_dir().to_path_buf(),
            log_dir: dirs.data_dir().join("logs"),
            home_dir: base.home_dir().to_path_buf(),
            system_plugin_dir: PathBuf::from(SYSTEM_PLUGIN_DIR),
            user_plugin_dir: dirs.data_dir().join("launcher"),
        })
    }

    /// Lays every directory out under a single root. Used by tests and
    /// portable installs.
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            log_dir: root.join("data").join("logs"),
            home_dir: root.to_path_buf(),
            system_plugin_dir: root.join("system").join("launcher"),
            user_plugin_dir: root.join("data").join("launcher"),
        }
    }

    pub fn ensure_exists(&self) -> Result<(), DirsError> {
        for dir in [&self.config_dir, &self.data_dir, &self.log_dir] {
            std::fs::create_dir_all(dir).map_err(|source| DirsError::CreateDirectory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn system_plugin_dir(&self) -> &Path {
        &self.system_plugin_dir
    }

    pub fn user_plugin_dir(&self) -> &Path {
        &self.user_plugin_dir
    }

    /// Expands a leading `~/` against the home directory.
    pub fn expand_home(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("~") {
            Ok(rest) => self.home_dir.join(rest),
            Err(_) => path.to_path_buf(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DirsError {
    #[error("unable to determine project directories for Lumen")]
    MissingProjectDirs,
    #[error("unable to determine the home directory")]
    MissingHomeDir,
    #[error("failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}
