//! Plugin discovery and query routing.

use crate::channel::{Channel, ChannelConfig, ChannelError};
use crate::descriptor::{is_descriptor_name, Descriptor, DescriptorError};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Reasons a single descriptor was not registered.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("plugin descriptor {path} has no pattern")]
    MissingPattern { path: PathBuf },
    #[error("plugin descriptor {path} has no exec")]
    MissingExec { path: PathBuf },
    #[error("invalid pattern in plugin descriptor {path}: {source}")]
    Pattern { path: PathBuf, source: regex::Error },
    #[error("failed to start plugin {name}: {source}")]
    Channel { name: String, source: ChannelError },
    #[error("failed to enumerate plugin directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A registered plugin: its descriptor, compiled pattern and live process.
#[derive(Debug)]
pub struct PluginSource {
    descriptor: Descriptor,
    descriptor_path: PathBuf,
    executable: PathBuf,
    pattern: Regex,
    channel: Channel,
}

impl PluginSource {
    pub fn name(&self) -> &str {
        self.descriptor.display_name()
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn descriptor_path(&self) -> &Path {
        &self.descriptor_path
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Whether this plugin's pattern matches anywhere in `query`.
    pub fn matches(&self, query: &str) -> bool {
        self.pattern.is_match(query)
    }
}

/// Ordered set of running plugins.
///
/// Registration order is the routing precedence: directories in the order
/// given, then descriptor file name order within each directory. The list
/// never changes after [`PluginRegistry::build`].
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: Vec<PluginSource>,
}

impl PluginRegistry {
    /// Scans each directory in order and starts every valid plugin found.
    ///
    /// Missing directories are skipped. A descriptor that cannot be read,
    /// compiled or spawned is logged and skipped.
    pub fn build<P: AsRef<Path>>(directories: &[P]) -> Self {
        let mut registry = Self::default();
        for dir in directories {
            registry.register_directory(dir.as_ref());
        }
        tracing::info!(plugins = registry.len(), "plugin registry ready");
        registry
    }

    fn register_directory(&mut self, dir: &Path) {
        tracing::debug!(directory = %dir.display(), "checking plugin directory");
        if !dir.is_dir() {
            return;
        }

        let paths = match descriptor_paths(dir) {
            Ok(paths) => paths,
            Err(err) => {
                tracing::warn!(error = %err, "skipping plugin directory");
                return;
            }
        };

        for path in paths {
            match register_descriptor(dir, &path) {
                Ok(source) => {
                    tracing::info!(
                        plugin = %source.name(),
                        pattern = %source.pattern,
                        pid = source.channel.pid(),
                        "registered plugin"
                    );
                    self.plugins.push(source);
                }
                Err(err) => tracing::warn!(error = %err, "skipping plugin"),
            }
        }
    }

    /// First plugin, in registration order, whose pattern matches `query`.
    pub fn match_query(&self, query: &str) -> Option<&PluginSource> {
        self.plugins.iter().find(|plugin| plugin.matches(query))
    }

    pub fn plugins(&self) -> &[PluginSource] {
        &self.plugins
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Descriptor files in `dir`, sorted by file name.
fn descriptor_paths(dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    let read_dir = fs::read_dir(dir).map_err(|source| RegistryError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = read_dir
        .filter_map(|entry| entry.ok())
        .filter(|entry| is_descriptor_name(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();
    Ok(paths)
}

fn register_descriptor(dir: &Path, path: &Path) -> Result<PluginSource, RegistryError> {
    let descriptor = Descriptor::read(path)?;

    let source = descriptor
        .pattern
        .as_deref()
        .ok_or_else(|| RegistryError::MissingPattern {
            path: path.to_path_buf(),
        })?;
    let pattern = Regex::new(source).map_err(|source| RegistryError::Pattern {
        path: path.to_path_buf(),
        source,
    })?;

    let exec = descriptor
        .exec
        .as_deref()
        .ok_or_else(|| RegistryError::MissingExec {
            path: path.to_path_buf(),
        })?;
    let executable = dir.join(exec);

    let name = descriptor.display_name().to_string();
    tracing::debug!(plugin = %name, executable = %executable.display(), "spawning plugin process");
    let config = ChannelConfig::new(&executable).working_dir(dir);
    let channel = Channel::spawn(name.clone(), &config)
        .map_err(|source| RegistryError::Channel { name, source })?;

    Ok(PluginSource {
        descriptor,
        descriptor_path: path.to_path_buf(),
        executable,
        pattern,
        channel,
    })
}
