//! The launcher-facing dispatch façade.

use crate::channel::ChannelError;
use crate::protocol::{self, Event, Response};
use crate::registry::{PluginRegistry, PluginSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors from fire-and-forget sends.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to encode {event} event: {source}")]
    Encode {
        event: &'static str,
        source: serde_json::Error,
    },
    #[error("plugin {plugin}: {source}")]
    Channel {
        plugin: String,
        source: ChannelError,
    },
}

/// Timing knobs for the service.
#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    /// Longest a dispatch waits for a plugin's reply.
    pub response_timeout: Duration,
    /// How long shutdown waits for plugins to exit before killing them.
    pub shutdown_grace: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

/// Which plugins left on their own and which had to be killed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub exited: Vec<String>,
    pub killed: Vec<String>,
}

impl ShutdownReport {
    /// True when every plugin honoured `quit` within the grace period.
    pub fn is_clean(&self) -> bool {
        self.killed.is_empty()
    }
}

/// Routes query strings to plugins and collects their replies.
///
/// Each call is synchronous from the caller's side and bounded by
/// [`ServiceOptions::response_timeout`]. Every failure along the way is
/// logged and reported as "no result".
pub struct LauncherService {
    registry: PluginRegistry,
    options: ServiceOptions,
    shut_down: AtomicBool,
}

impl LauncherService {
    pub fn new(registry: PluginRegistry, options: ServiceOptions) -> Self {
        Self {
            registry,
            options,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn options(&self) -> ServiceOptions {
        self.options
    }

    /// Sends `query` to the first matching plugin and returns its reply.
    ///
    /// Returns `None` without touching any process when nothing matches.
    pub fn dispatch(&self, query: &str) -> Option<(&PluginSource, Response)> {
        let plugin = self.registry.match_query(query)?;
        let response = self.request(
            plugin,
            &Event::Query {
                value: query.to_string(),
            },
        )?;
        Some((plugin, response))
    }

    /// Reads the reply to the latest request sent to `plugin`, e.g. after
    /// [`LauncherService::complete`]. Late replies to earlier requests are
    /// skipped.
    pub fn listen(&self, plugin: &PluginSource) -> Option<Response> {
        match plugin.channel().read_line(self.options.response_timeout) {
            Ok(line) => protocol::decode(&line),
            Err(err) => {
                tracing::warn!(plugin = %plugin.name(), error = %err, "no reply from plugin");
                None
            }
        }
    }

    /// Asks `plugin` for a fill suggestion. The reply is read with
    /// [`LauncherService::listen`].
    pub fn complete(&self, plugin: &PluginSource) -> Result<(), ServiceError> {
        self.send(plugin, &Event::Complete)
    }

    /// Sends `complete` and waits for the resulting fill text.
    pub fn fill(&self, plugin: &PluginSource) -> Option<String> {
        match self.request(plugin, &Event::Complete)? {
            Response::Fill { text } => Some(text),
            other => {
                tracing::debug!(plugin = %plugin.name(), response = ?other, "expected fill response");
                None
            }
        }
    }

    /// Tells `plugin` the user picked selection `id`. No reply is expected.
    pub fn submit(&self, plugin: &PluginSource, id: u32) -> Result<(), ServiceError> {
        self.send(plugin, &Event::Submit { id })
    }

    /// Sends `quit` to every plugin and returns immediately.
    pub fn request_shutdown(&self) {
        for plugin in self.registry.plugins() {
            if let Err(err) = self.send(plugin, &Event::Quit) {
                tracing::debug!(error = %err, "quit not delivered");
            }
        }
    }

    /// Sends `quit` to every plugin, waits up to `grace` for them to exit,
    /// then kills the ones still running.
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.shut_down.store(true, Ordering::SeqCst);
        self.request_shutdown();

        let deadline = Instant::now() + grace;
        let mut report = ShutdownReport::default();
        for plugin in self.registry.plugins() {
            let channel = plugin.channel();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if channel.wait_for_exit(remaining) {
                report.exited.push(plugin.name().to_string());
                continue;
            }

            tracing::warn!(plugin = %plugin.name(), pid = channel.pid(), "plugin ignored quit, killing");
            if let Err(err) = channel.kill() {
                tracing::error!(plugin = %plugin.name(), error = %err, "failed to kill plugin");
            }
            report.killed.push(plugin.name().to_string());
        }

        tracing::info!(
            exited = report.exited.len(),
            killed = report.killed.len(),
            "plugins shut down"
        );
        report
    }

    fn send(&self, plugin: &PluginSource, event: &Event) -> Result<(), ServiceError> {
        let line = encode(event)?;
        plugin
            .channel()
            .write_line(&line, event.expects_reply())
            .map_err(|source| ServiceError::Channel {
                plugin: plugin.name().to_string(),
                source,
            })
    }

    fn request(&self, plugin: &PluginSource, event: &Event) -> Option<Response> {
        let line = match encode(event) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(error = %err, "dropping request");
                return None;
            }
        };

        match plugin
            .channel()
            .exchange(&line, self.options.response_timeout)
        {
            Ok(reply) => protocol::decode(&reply),
            Err(err) => {
                tracing::warn!(
                    plugin = %plugin.name(),
                    event = event.name(),
                    error = %err,
                    "no reply from plugin"
                );
                None
            }
        }
    }
}

impl Drop for LauncherService {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            self.shutdown(self.options.shutdown_grace);
        }
    }
}

fn encode(event: &Event) -> Result<String, ServiceError> {
    protocol::encode(event).map_err(|source| ServiceError::Encode {
        event: event.name(),
        source,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::{install_plugin, CAT};

    fn fast() -> ServiceOptions {
        ServiceOptions {
            response_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    const RESPONDER: &str = r#"while IFS= read -r line; do
case "$line" in
  *'"event":"query"'*) echo '{"kind":"queried","selections":[]}' ;;
  *'"event":"complete"'*) echo '{"kind":"fill","text":"done"}' ;;
  *'"event":"quit"'*) exit 0 ;;
esac
done"#;

    #[test]
    fn dispatch_without_match_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        install_plugin(dir.path(), "calc", "^calc:", CAT);
        let service = LauncherService::new(PluginRegistry::build(&[dir.path()]), fast());

        assert!(service.dispatch("hello").is_none());
    }

    #[test]
    fn empty_selections_are_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        install_plugin(dir.path(), "empty", "^e", RESPONDER);
        let service = LauncherService::new(PluginRegistry::build(&[dir.path()]), fast());

        let (plugin, response) = service.dispatch("empty").expect("plugin should reply");
        assert_eq!(plugin.name(), "empty");
        assert_eq!(response, Response::Queried { selections: vec![] });
    }

    #[test]
    fn complete_then_listen_yields_fill() {
        let dir = tempfile::tempdir().unwrap();
        install_plugin(dir.path(), "filler", ".", RESPONDER);
        let service = LauncherService::new(PluginRegistry::build(&[dir.path()]), fast());
        let plugin = &service.registry().plugins()[0];

        service.complete(plugin).unwrap();
        assert_eq!(
            service.listen(plugin),
            Some(Response::Fill {
                text: "done".into()
            })
        );
        assert_eq!(service.fill(plugin).as_deref(), Some("done"));
    }

    #[test]
    fn listen_after_timed_out_query_returns_fill() {
        let dir = tempfile::tempdir().unwrap();
        install_plugin(
            dir.path(),
            "sluggish",
            ".",
            r#"while IFS= read -r line; do
case "$line" in
  *'"event":"query"'*) sleep 0.3; echo '{"kind":"queried","selections":[]}' ;;
  *'"event":"complete"'*) echo '{"kind":"fill","text":"done"}' ;;
  *'"event":"quit"'*) exit 0 ;;
esac
done"#,
        );
        let service = LauncherService::new(
            PluginRegistry::build(&[dir.path()]),
            ServiceOptions {
                response_timeout: Duration::from_millis(50),
                shutdown_grace: Duration::from_secs(5),
            },
        );
        let plugin = &service.registry().plugins()[0];

        assert!(service.dispatch("query").is_none());
        service.complete(plugin).unwrap();
        let mut reply = None;
        for _ in 0..40 {
            reply = service.listen(plugin);
            if reply.is_some() {
                break;
            }
        }
        assert_eq!(
            reply,
            Some(Response::Fill {
                text: "done".into()
            })
        );
    }

    #[test]
    fn unrecognized_reply_is_no_result() {
        let dir = tempfile::tempdir().unwrap();
        install_plugin(
            dir.path(),
            "odd",
            ".",
            r#"while IFS= read -r line; do echo '{"kind":"surprise"}'; done"#,
        );
        let service = LauncherService::new(PluginRegistry::build(&[dir.path()]), fast());

        assert!(service.dispatch("anything").is_none());
    }

    #[test]
    fn submit_expects_no_reply() {
        let dir = tempfile::tempdir().unwrap();
        install_plugin(dir.path(), "sub", ".", RESPONDER);
        let service = LauncherService::new(PluginRegistry::build(&[dir.path()]), fast());
        let plugin = &service.registry().plugins()[0];

        service.submit(plugin, 0).unwrap();
        let (_, response) = service.dispatch("next").unwrap();
        assert_eq!(response, Response::Queried { selections: vec![] });
    }

    #[test]
    fn shutdown_reports_exited_and_killed() {
        let dir = tempfile::tempdir().unwrap();
        install_plugin(dir.path(), "polite", "a", RESPONDER);
        install_plugin(dir.path(), "stubborn", "b", "while :; do sleep 1; done");
        let service = LauncherService::new(PluginRegistry::build(&[dir.path()]), fast());

        let report = service.shutdown(Duration::from_millis(500));
        assert_eq!(report.exited, vec!["polite".to_string()]);
        assert_eq!(report.killed, vec!["stubborn".to_string()]);
        assert!(!report.is_clean());
    }

    #[test]
    fn quitting_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        install_plugin(dir.path(), "polite", ".", RESPONDER);
        let service = LauncherService::new(PluginRegistry::build(&[dir.path()]), fast());

        assert!(service.shutdown(Duration::from_secs(5)).is_clean());
        service.request_shutdown();
        let plugin = &service.registry().plugins()[0];
        assert!(matches!(
            service.submit(plugin, 1),
            Err(ServiceError::Channel {
                source: ChannelError::Closed,
                ..
            })
        ));
        assert!(service.shutdown(Duration::from_millis(50)).is_clean());
    }
}
