use lumen_plugin::{Response, Selection};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;

/// Most entries offered for one query.
pub const MAX_SELECTIONS: usize = 10;

const DIRECTORY_CONTENT_TYPE: &str = "inode/directory";

#[derive(Debug, Clone)]
struct Entry {
    selection: Selection,
    directory: bool,
}

/// State of the files plugin between events.
#[derive(Debug, Default)]
pub struct App {
    home: Option<PathBuf>,
    parent: String,
    last_query: String,
    entries: Vec<Entry>,
}

impl App {
    pub fn new(home: Option<PathBuf>) -> Self {
        Self {
            home,
            ..Self::default()
        }
    }

    /// Lists the parent directory of `input`, keeping entries whose name
    /// contains the fragment after the last `/`.
    pub fn query(&mut self, input: &str) -> Response {
        self.last_query = input.to_string();
        self.entries.clear();

        let (parent, fragment) = split_query(input);
        self.parent = parent.to_string();

        let dir = self.expand(parent);
        match fs::read_dir(&dir) {
            Ok(read_dir) => {
                for entry in read_dir.filter_map(|e| e.ok()) {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !fragment.is_empty() && !name.contains(fragment) {
                        continue;
                    }
                    let directory = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                    self.entries.push(Entry {
                        selection: Selection {
                            id: 0,
                            name,
                            description: None,
                            icon: None,
                            content_type: directory.then(|| DIRECTORY_CONTENT_TYPE.to_string()),
                        },
                        directory,
                    });
                    if self.entries.len() == MAX_SELECTIONS {
                        break;
                    }
                }
            }
            Err(err) => {
                tracing::debug!(dir = %dir.display(), error = %err, "cannot list directory");
            }
        }

        self.entries
            .sort_by_key(|entry| entry.selection.name.to_lowercase());
        for (id, entry) in self.entries.iter_mut().enumerate() {
            entry.selection.id = id as u32;
        }

        Response::Queried {
            selections: self.entries.iter().map(|e| e.selection.clone()).collect(),
        }
    }

    /// Path of the best selection, or the raw last query when there is none.
    pub fn complete(&self) -> Response {
        let text = self
            .entries
            .first()
            .map(|entry| self.selection_path(entry))
            .unwrap_or_else(|| self.last_query.clone());
        Response::Fill { text }
    }

    /// Filesystem path of selection `id` from the latest query.
    pub fn submit(&self, id: u32) -> Option<PathBuf> {
        let entry = self.entries.get(id as usize)?;
        Some(self.expand(&self.selection_path(entry)))
    }

    fn selection_path(&self, entry: &Entry) -> String {
        let mut text = self.parent.clone();
        if !text.ends_with('/') {
            text.push('/');
        }
        text.push_str(&entry.selection.name);
        if entry.directory {
            text.push('/');
        }
        text
    }

    fn expand(&self, path: &str) -> PathBuf {
        match (path.strip_prefix('~'), &self.home) {
            (Some(rest), Some(home)) => home.join(rest.trim_start_matches('/')),
            _ => PathBuf::from(path),
        }
    }
}

/// Splits a query into the directory to list and the name fragment.
fn split_query(input: &str) -> (&str, &str) {
    if input == "~" {
        return ("~/", "");
    }
    match input.rfind('/') {
        Some(0) => ("/", &input[1..]),
        Some(idx) if idx + 1 == input.len() => (input, ""),
        Some(idx) => (&input[..idx], &input[idx + 1..]),
        None => (".", input),
    }
}

/// Opens `path` with the desktop's default handler.
pub fn open(path: &Path) {
    if spawn_reaped(Command::new("xdg-open").arg(path)).is_some() {
        tracing::info!(path = %path.display(), "opened");
    }
}

/// Spawns `cmd` and reaps it from a short-lived thread so it never lingers
/// as a zombie.
fn spawn_reaped(cmd: &mut Command) -> Option<thread::JoinHandle<()>> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!(%program, error = %err, "failed to spawn");
            return None;
        }
    };

    let reaper = thread::Builder::new()
        .name(format!("reap-{program}"))
        .spawn(move || match child.wait() {
            Ok(status) if !status.success() => {
                tracing::warn!(%program, %status, "opener exited unsuccessfully")
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(%program, error = %err, "failed to reap"),
        });
    match reaper {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "failed to start reaper thread");
            None
        }
    }
}
