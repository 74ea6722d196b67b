use anyhow::Result;
use clap::{Parser, Subcommand};
use lumen_core::{init_logging, AppDirs, Config};
use lumen_plugin::{LauncherService, PluginRegistry, Response, ServiceOptions};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "lumen", version, about = "Launcher plugin host")]
struct Cli {
    /// System-wide plugin directory override (takes precedence over config)
    #[arg(long, global = true)]
    system_dir: Option<PathBuf>,
    /// Per-user plugin directory override (takes precedence over config)
    #[arg(long, global = true)]
    user_dir: Option<PathBuf>,
    /// Plugin reply timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Plugin management commands
    #[command(subcommand)]
    Plugins(PluginsCommand),
    /// Send one query to the matching plugin and print its reply
    Query {
        /// Query text, routed by plugin pattern
        text: String,
    },
    /// Read queries from stdin, one per line
    Shell,
}

#[derive(Debug, Subcommand)]
enum PluginsCommand {
    /// List registered plugins in routing precedence order
    List,
}

/// One line of input to the interactive shell.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ShellInput {
    Query(String),
    Complete,
    Submit(u32),
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
enum ShellInputError {
    #[error("usage: :submit <id>")]
    SubmitId,
    #[error("unknown command {0}; try :complete, :submit <id> or :quit")]
    UnknownCommand(String),
}

impl ShellInput {
    fn parse(line: &str) -> Result<Self, ShellInputError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(command) = line.strip_prefix(':') else {
            return Ok(ShellInput::Query(line.to_string()));
        };

        let mut parts = command.split_whitespace();
        match parts.next() {
            Some("complete") => Ok(ShellInput::Complete),
            Some("quit") | Some("q") => Ok(ShellInput::Quit),
            Some("submit") => parts
                .next()
                .and_then(|id| id.parse().ok())
                .map(ShellInput::Submit)
                .ok_or(ShellInputError::SubmitId),
            other => Err(ShellInputError::UnknownCommand(
                other.unwrap_or_default().to_string(),
            )),
        }
    }
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(dir) = &self.system_dir {
            config.plugins.system_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.user_dir {
            config.plugins.user_dir = Some(dir.clone());
        }
        if let Some(ms) = self.timeout_ms {
            config.plugins.response_timeout_ms = ms;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let mut config = Config::load_or_default(&dirs)?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    let _logging = init_logging(&config.logging, &dirs)?;

    let directories = config.plugins.directories(&dirs);
    tracing::info!(
        "Starting Lumen (config dir: {}, plugin dirs: {})",
        dirs.config_dir().display(),
        directories
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let service = LauncherService::new(
        PluginRegistry::build(&directories),
        ServiceOptions {
            response_timeout: config.plugins.response_timeout(),
            shutdown_grace: config.plugins.shutdown_grace(),
        },
    );

    match cli.command {
        Command::Plugins(PluginsCommand::List) => print_plugins(&service),
        Command::Query { text } => match service.dispatch(&text) {
            Some((plugin, response)) => print_response(plugin.name(), &response),
            None => println!("no plugin result"),
        },
        Command::Shell => run_shell(&service, io::stdin().lock())?,
    }

    let report = service.shutdown(config.plugins.shutdown_grace());
    if !report.is_clean() {
        tracing::warn!(killed = ?report.killed, "some plugins had to be killed");
    }

    Ok(())
}

fn run_shell(service: &LauncherService, input: impl BufRead) -> io::Result<()> {
    let mut last_plugin = None;
    prompt()?;
    for line in input.lines() {
        let line = line?;
        match ShellInput::parse(&line) {
            Ok(ShellInput::Quit) => break,
            Ok(ShellInput::Query(text)) if text.is_empty() => {}
            Ok(ShellInput::Query(text)) => match service.dispatch(&text) {
                Some((plugin, response)) => {
                    print_response(plugin.name(), &response);
                    let closing = matches!(response, Response::Close);
                    last_plugin = Some(plugin);
                    if closing {
                        break;
                    }
                }
                None => println!("no plugin result"),
            },
            Ok(ShellInput::Complete) => match last_plugin.and_then(|p| service.fill(p)) {
                Some(text) => println!("fill: {text}"),
                None => println!("no completion"),
            },
            Ok(ShellInput::Submit(id)) => match last_plugin {
                Some(plugin) => {
                    if let Err(err) = service.submit(plugin, id) {
                        println!("submit failed: {err}");
                    }
                }
                None => println!("nothing to submit; run a query first"),
            },
            Err(err) => println!("{err}"),
        }
        prompt()?;
    }
    Ok(())
}

fn prompt() -> io::Result<()> {
    let mut stdout = io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()
}

fn print_plugins(service: &LauncherService) {
    let registry = service.registry();
    if registry.is_empty() {
        println!("No plugins registered. Add <name>.json descriptors to a plugin directory.");
        return;
    }

    for plugin in registry.plugins() {
        println!("Plugin: {}", plugin.name());
        let description = &plugin.descriptor().description;
        if !description.is_empty() {
            println!("  description: {}", description);
        }
        println!("  pattern: {}", plugin.pattern());
        println!("  exec: {}", plugin.executable().display());
        println!("  descriptor: {}", plugin.descriptor_path().display());
    }
}

fn print_response(plugin: &str, response: &Response) {
    println!("{}", format_response(plugin, response));
}

fn format_response(plugin: &str, response: &Response) -> String {
    match response {
        Response::Queried { selections } if selections.is_empty() => {
            format!("[{plugin}] no matches")
        }
        Response::Queried { selections } => {
            let mut lines = vec![format!("[{plugin}]")];
            for selection in selections {
                match &selection.description {
                    Some(description) => lines.push(format!(
                        "  [{}] {} — {}",
                        selection.id, selection.name, description
                    )),
                    None => lines.push(format!("  [{}] {}", selection.id, selection.name)),
                }
            }
            lines.join("\n")
        }
        Response::Fill { text } => format!("[{plugin}] fill: {text}"),
        Response::Close => format!("[{plugin}] closed"),
    }
}
