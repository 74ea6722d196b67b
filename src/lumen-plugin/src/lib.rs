//! External plugin support for the Lumen launcher.
//!
//! This crate provides:
//! - Plugin descriptors discovered as JSON files in plugin directories
//! - A line-oriented stdio [`Channel`] that owns each plugin process
//! - The JSON [`Event`]/[`Response`] protocol spoken over that channel
//! - A [`PluginRegistry`] that routes query strings by regular expression
//! - The [`LauncherService`] façade used by the search UI
//!
//! # Plugin Protocol
//!
//! Plugins read events from stdin and write responses to stdout, one JSON
//! object per line. Anything written to stderr is logged by the launcher.
//!
//! ```text
//! launcher -> plugin: {"event":"query","value":"calc:1+1"}
//! plugin -> launcher: {"kind":"queried","selections":[{"id":0,"name":"2","description":null}]}
//! launcher -> plugin: {"event":"complete"}
//! plugin -> launcher: {"kind":"fill","text":"calc:2"}
//! launcher -> plugin: {"event":"submit","id":0}
//! launcher -> plugin: {"event":"quit"}
//! ```
//!
//! `submit` and `quit` get no reply. Only one request is outstanding per
//! plugin at a time.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lumen_plugin::{LauncherService, PluginRegistry, ServiceOptions};
//!
//! let registry = PluginRegistry::build(&["/usr/lib/lumen/launcher"]);
//! let service = LauncherService::new(registry, ServiceOptions::default());
//! if let Some((plugin, response)) = service.dispatch("/home/") {
//!     println!("{} answered {:?}", plugin.name(), response);
//! }
//! ```

mod channel;
mod descriptor;
mod registry;
mod service;
pub mod protocol;

#[cfg(all(test, unix))]
mod testing;

pub use channel::{Channel, ChannelConfig, ChannelError};
pub use descriptor::{Descriptor, DescriptorError, DESCRIPTOR_SUFFIX};
pub use protocol::{Event, Response, Selection};
pub use registry::{PluginRegistry, PluginSource, RegistryError};
pub use service::{LauncherService, ServiceError, ServiceOptions, ShutdownReport};
