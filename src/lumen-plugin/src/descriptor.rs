//! Plugin descriptor files.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name suffix that marks a plugin descriptor.
pub const DESCRIPTOR_SUFFIX: &str = ".json";

/// Static description of one plugin, read from a JSON file.
///
/// Only JSON syntax is checked at load time. A descriptor without a
/// `pattern` or `exec` still loads and is rejected during registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Regular expression tested anywhere in the query string.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Executable path, relative to the descriptor's directory.
    #[serde(default)]
    pub exec: Option<String>,
    #[serde(default)]
    pub icon: String,
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read plugin descriptor {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse plugin descriptor {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl Descriptor {
    /// Reads and parses a descriptor file.
    pub fn read(path: &Path) -> Result<Self, DescriptorError> {
        tracing::debug!(path = %path.display(), "found plugin descriptor");
        let contents = fs::read_to_string(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents).map_err(|source| DescriptorError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    /// Name used in logs; falls back to a placeholder for unnamed plugins.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "<unnamed>"
        } else {
            &self.name
        }
    }
}

/// Whether a directory entry name looks like a descriptor file.
pub fn is_descriptor_name(name: &str) -> bool {
    name.ends_with(DESCRIPTOR_SUFFIX)
}
