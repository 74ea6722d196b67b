//! Reference Lumen plugin: completes and opens filesystem paths.

mod app;

use app::App;
use directories::BaseDirs;
use lumen_core::LogLevel;
use lumen_plugin::protocol::{self, Event, Response};
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use thiserror::Error;

#[derive(Debug, Error)]
enum FilesError {
    #[error("failed to read from launcher: {0}")]
    Read(io::Error),
    #[error("failed to write to launcher: {0}")]
    Write(io::Error),
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    // Stdout carries the protocol, so diagnostics go to stderr.
    if let Err(err) = lumen_core::init_stderr_logging(LogLevel::Info) {
        eprintln!("lumen-files: {err}");
    }

    let home = BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
    let mut app = App::new(home);

    match run(&mut app, io::stdin().lock(), io::stdout().lock()) {
        Ok(()) => {
            tracing::info!("exiting plugin");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "plugin stopped");
            ExitCode::FAILURE
        }
    }
}

fn run(app: &mut App, input: impl BufRead, mut output: impl Write) -> Result<(), FilesError> {
    for line in input.lines() {
        let line = line.map_err(FilesError::Read)?;
        let Some(event) = protocol::decode_event(&line) else {
            tracing::warn!(%line, "input is not a launcher event");
            continue;
        };

        match event {
            Event::Query { value } => reply(&mut output, &app.query(&value))?,
            Event::Complete => reply(&mut output, &app.complete())?,
            Event::Submit { id } => {
                if let Some(path) = app.submit(id) {
                    app::open(&path);
                }
            }
            Event::Quit => break,
        }
    }
    Ok(())
}

fn reply(output: &mut impl Write, response: &Response) -> Result<(), FilesError> {
    let line = protocol::encode_response(response)?;
    writeln!(output, "{line}").map_err(FilesError::Write)?;
    output.flush().map_err(FilesError::Write)
}
