//! Line-oriented stdio channel to one plugin process.
//!
//! A [`Channel`] owns the child process and three background threads:
//! one forwards stdout lines into a queue, one drains stderr into the log,
//! and one watches for process exit. Callers talk to the channel
//! synchronously with a deadline; they never block on the pipes directly.

use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How often the exit watch polls the child.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Stdout lines buffered between reads; further lines are dropped.
const LINE_QUEUE_CAPACITY: usize = 256;

/// Errors from channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to spawn plugin process {path}: {source}")]
    Spawn { path: PathBuf, source: io::Error },
    #[error("plugin process has no stdin")]
    NoStdin,
    #[error("plugin process has no stdout")]
    NoStdout,
    #[error("plugin process has no stderr")]
    NoStderr,
    #[error("failed to start channel worker thread: {0}")]
    Thread(io::Error),
    #[error("failed to write to plugin: {0}")]
    Write(io::Error),
    #[error("failed to kill plugin process: {0}")]
    Kill(io::Error),
    #[error("plugin did not reply within {0:?}")]
    Timeout(Duration),
    #[error("plugin channel is closed")]
    Closed,
}

/// How to launch a plugin process.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Path to the plugin executable.
    pub executable: PathBuf,
    /// Arguments to pass to the plugin.
    pub args: Vec<String>,
    /// Working directory for the plugin process.
    pub working_dir: Option<PathBuf>,
}

impl ChannelConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

struct Shared {
    closed: AtomicBool,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    status: Mutex<Option<ExitStatus>>,
}

/// A running plugin process and its line streams.
pub struct Channel {
    name: String,
    pid: u32,
    shared: Arc<Shared>,
    lines: Receiver<String>,
    /// Disconnects once the exit watch has fired.
    exited: Receiver<()>,
    /// Serializes requests; holds the number of replies still owed.
    in_flight: Mutex<usize>,
}

impl Channel {
    /// Starts the plugin process and its background workers.
    pub fn spawn(name: impl Into<String>, config: &ChannelConfig) -> Result<Self, ChannelError> {
        let name = name.into();
        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ChannelError::Spawn {
            path: config.executable.clone(),
            source,
        })?;
        let pid = child.id();

        let (stdin, stdout, stderr) = match take_pipes(&mut child) {
            Ok(pipes) => pipes,
            Err(err) => {
                reap(&mut child);
                return Err(err);
            }
        };

        let (line_tx, lines) = crossbeam_channel::bounded(LINE_QUEUE_CAPACITY);
        let (exit_tx, exited) = crossbeam_channel::bounded(0);

        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            status: Mutex::new(None),
        });

        let started = start_workers(&name, pid, &shared, stdout, stderr, line_tx, exit_tx);
        if let Err(err) = started {
            reap(&mut lock(&shared.child));
            return Err(err);
        }

        tracing::debug!(plugin = %name, pid, executable = %config.executable.display(), "spawned plugin process");

        Ok(Self {
            name,
            pid,
            shared,
            lines,
            exited,
            in_flight: Mutex::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// True once the exit watch has observed the process terminating.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Exit status, if the process has terminated.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *lock(&self.shared.status)
    }

    /// Writes one line to the plugin's stdin. When `expects_reply` is set
    /// the channel owes one reply line for it, which a later
    /// [`Channel::read_line`] or [`Channel::exchange`] accounts for.
    pub fn write_line(&self, line: &str, expects_reply: bool) -> Result<(), ChannelError> {
        let mut owed = lock(&self.in_flight);
        self.write_unlocked(line)?;
        if expects_reply {
            *owed += 1;
        }
        Ok(())
    }

    /// Waits up to `timeout` for the reply to the most recent request.
    ///
    /// Replies owed to earlier requests that timed out are skipped.
    pub fn read_line(&self, timeout: Duration) -> Result<String, ChannelError> {
        let mut owed = lock(&self.in_flight);
        self.read_owed(&mut owed, timeout)
    }

    /// Writes a request line and waits for its single reply line.
    ///
    /// Late replies to earlier requests are discarded, so the line returned
    /// always answers this request.
    pub fn exchange(&self, line: &str, timeout: Duration) -> Result<String, ChannelError> {
        let mut owed = lock(&self.in_flight);
        if *owed == 0 {
            self.discard_unsolicited();
        }
        self.write_unlocked(line)?;
        *owed += 1;
        self.read_owed(&mut owed, timeout)
    }

    /// Blocks until the process exits or `timeout` elapses. Returns whether
    /// the process has exited.
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        !matches!(
            self.exited.recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }

    /// Forcibly terminates the process. A no-op once it has exited.
    pub fn kill(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Ok(());
        }
        let mut child = lock(&self.shared.child);
        match child.kill() {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(ChannelError::Kill(err)),
        }
    }

    fn write_unlocked(&self, line: &str) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut guard = lock(&self.shared.stdin);
        let stdin = guard.as_mut().ok_or(ChannelError::Closed)?;

        let result = stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush());

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                guard.take();
                Err(ChannelError::Closed)
            }
            Err(err) => Err(ChannelError::Write(err)),
        }
    }

    /// Reads until the last owed reply arrives. On timeout the count is
    /// left as is, so the late reply is skipped by the next read.
    fn read_owed(&self, owed: &mut usize, timeout: Duration) -> Result<String, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_closed() {
                return Err(ChannelError::Closed);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = select! {
                recv(self.lines) -> line => line.map_err(|_| ChannelError::Closed)?,
                recv(self.exited) -> _ => return Err(ChannelError::Closed),
                default(remaining) => return Err(ChannelError::Timeout(timeout)),
            };

            if *owed > 1 {
                *owed -= 1;
                tracing::debug!(plugin = %self.name, %line, "discarding late reply");
                continue;
            }
            *owed = owed.saturating_sub(1);
            return Ok(line);
        }
    }

    fn discard_unsolicited(&self) {
        for line in self.lines.try_iter() {
            tracing::debug!(plugin = %self.name, %line, "discarding unsolicited line");
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(err) = self.kill() {
            tracing::warn!(plugin = %self.name, pid = self.pid, error = %err, "failed to kill plugin on drop");
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn start_workers(
    name: &str,
    pid: u32,
    shared: &Arc<Shared>,
    stdout: impl Read + Send + 'static,
    stderr: impl Read + Send + 'static,
    line_tx: Sender<String>,
    exit_tx: Sender<()>,
) -> Result<(), ChannelError> {
    let plugin = name.to_string();
    spawn_worker(format!("{name}-stdout"), move || {
        forward_stdout(&plugin, stdout, line_tx)
    })?;

    let plugin = name.to_string();
    spawn_worker(format!("{name}-stderr"), move || {
        drain_stderr(&plugin, pid, stderr)
    })?;

    let plugin = name.to_string();
    let shared = Arc::clone(shared);
    spawn_worker(format!("{name}-watch"), move || {
        watch_exit(&plugin, pid, &shared);
        drop(exit_tx);
    })
}

fn take_pipes(child: &mut Child) -> Result<(ChildStdin, ChildStdout, ChildStderr), ChannelError> {
    let stdin = child.stdin.take().ok_or(ChannelError::NoStdin)?;
    let stdout = child.stdout.take().ok_or(ChannelError::NoStdout)?;
    let stderr = child.stderr.take().ok_or(ChannelError::NoStderr)?;
    Ok((stdin, stdout, stderr))
}

fn spawn_worker(
    name: String,
    f: impl FnOnce() + Send + 'static,
) -> Result<(), ChannelError> {
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map(|_| ())
        .map_err(ChannelError::Thread)
}

/// Reads newline-terminated chunks, tolerating invalid UTF-8.
fn next_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

fn forward_stdout(plugin: &str, stdout: impl Read, tx: Sender<String>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match next_line(&mut reader) {
            Ok(Some(line)) => match tx.try_send(line) {
                Ok(()) => {}
                Err(TrySendError::Full(line)) => {
                    tracing::warn!(plugin, %line, "plugin output queue full, dropping line");
                }
                Err(TrySendError::Disconnected(_)) => break,
            },
            Ok(None) => {
                tracing::debug!(plugin, "plugin stdout closed");
                break;
            }
            Err(err) => {
                tracing::warn!(plugin, error = %err, "failed to read plugin stdout");
                break;
            }
        }
    }
}

fn drain_stderr(plugin: &str, pid: u32, stderr: impl Read) {
    let mut reader = BufReader::new(stderr);
    while let Ok(Some(line)) = next_line(&mut reader) {
        if !line.is_empty() {
            tracing::warn!(plugin, pid, "stderr: {}", line);
        }
    }
}

fn watch_exit(plugin: &str, pid: u32, shared: &Shared) {
    let status = loop {
        let polled = lock(&shared.child).try_wait();
        match polled {
            Ok(Some(status)) => break Some(status),
            Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
            Err(err) => {
                tracing::warn!(plugin, pid, error = %err, "lost track of plugin process");
                break None;
            }
        }
    };

    shared.closed.store(true, Ordering::SeqCst);
    lock(&shared.stdin).take();
    *lock(&shared.status) = status;

    match status {
        Some(status) => tracing::info!(plugin, pid, %status, "plugin process exited"),
        None => tracing::info!(plugin, pid, "plugin channel closed"),
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::script;

    const SHORT: Duration = Duration::from_secs(5);

    #[test]
    fn echoes_lines_in_order() {
        let (_dir, path) = script("echo", "while IFS= read -r line; do echo \"$line\"; done");
        let channel = Channel::spawn("echo", &ChannelConfig::new(&path)).unwrap();

        assert_eq!(channel.exchange("one", SHORT).unwrap(), "one");
        assert_eq!(channel.exchange("two", SHORT).unwrap(), "two");
        assert!(!channel.is_closed());
    }

    #[test]
    fn silent_plugin_times_out_without_hanging() {
        let (_dir, path) = script("mute", "while IFS= read -r line; do :; done");
        let channel = Channel::spawn("mute", &ChannelConfig::new(&path)).unwrap();

        let err = channel
            .exchange("hello", Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }

    const SLOW_ECHO: &str = "while IFS= read -r line; do sleep 0.2; echo \"$line\"; done";

    #[test]
    fn late_reply_is_not_delivered_to_next_request() {
        let (_dir, path) = script("slow", SLOW_ECHO);
        let channel = Channel::spawn("slow", &ChannelConfig::new(&path)).unwrap();

        assert!(matches!(
            channel.exchange("first", Duration::from_millis(50)),
            Err(ChannelError::Timeout(_))
        ));
        assert_eq!(channel.exchange("second", SHORT).unwrap(), "second");
        assert_eq!(channel.exchange("third", SHORT).unwrap(), "third");
    }

    #[test]
    fn late_reply_already_queued_is_skipped() {
        let (_dir, path) = script("slow", SLOW_ECHO);
        let channel = Channel::spawn("slow", &ChannelConfig::new(&path)).unwrap();

        assert!(matches!(
            channel.exchange("first", Duration::from_millis(50)),
            Err(ChannelError::Timeout(_))
        ));
        thread::sleep(Duration::from_millis(400));
        assert_eq!(channel.exchange("second", SHORT).unwrap(), "second");
    }

    #[test]
    fn read_after_write_skips_replies_owed_to_timed_out_requests() {
        let (_dir, path) = script("slow", SLOW_ECHO);
        let channel = Channel::spawn("slow", &ChannelConfig::new(&path)).unwrap();

        assert!(matches!(
            channel.exchange("query", Duration::from_millis(50)),
            Err(ChannelError::Timeout(_))
        ));
        thread::sleep(Duration::from_millis(400));
        channel.write_line("complete", true).unwrap();
        assert_eq!(channel.read_line(SHORT).unwrap(), "complete");
    }

    #[test]
    fn fire_and_forget_writes_owe_nothing() {
        let (_dir, path) = script(
            "picky",
            "while IFS= read -r line; do [ \"$line\" = submit ] || echo \"$line\"; done",
        );
        let channel = Channel::spawn("picky", &ChannelConfig::new(&path)).unwrap();

        channel.write_line("submit", false).unwrap();
        assert_eq!(channel.exchange("query", SHORT).unwrap(), "query");
    }

    #[test]
    fn exit_closes_channel_and_fails_fast() {
        let (_dir, path) = script("quitter", "IFS= read -r line; exit 3");
        let channel = Channel::spawn("quitter", &ChannelConfig::new(&path)).unwrap();

        channel.write_line("bye", false).unwrap();
        assert!(channel.wait_for_exit(SHORT));
        assert!(channel.is_closed());
        assert_eq!(channel.exit_status().and_then(|s| s.code()), Some(3));

        assert!(matches!(
            channel.read_line(Duration::from_secs(60)),
            Err(ChannelError::Closed)
        ));
        assert!(matches!(channel.write_line("again", false), Err(ChannelError::Closed)));
    }

    #[test]
    fn read_observes_exit_while_waiting() {
        let (_dir, path) = script("crash", "IFS= read -r line; exit 1");
        let channel = Channel::spawn("crash", &ChannelConfig::new(&path)).unwrap();

        let err = channel.exchange("go", Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }

    #[test]
    fn stderr_does_not_reach_protocol_stream() {
        let (_dir, path) = script(
            "noisy",
            "while IFS= read -r line; do echo \"warning: $line\" >&2; echo ok; done",
        );
        let channel = Channel::spawn("noisy", &ChannelConfig::new(&path)).unwrap();
        assert_eq!(channel.exchange("x", SHORT).unwrap(), "ok");
    }

    #[test]
    fn kill_terminates_stuck_process() {
        let (_dir, path) = script("stuck", "trap '' TERM; while :; do sleep 1; done");
        let channel = Channel::spawn("stuck", &ChannelConfig::new(&path)).unwrap();

        assert!(!channel.wait_for_exit(Duration::from_millis(50)));
        channel.kill().unwrap();
        assert!(channel.wait_for_exit(SHORT));
        channel.kill().unwrap();
    }

    #[test]
    fn passes_args_and_working_dir() {
        let (dir, path) = script(
            "greeter",
            "IFS= read -r line; echo \"$1 $(pwd -P)\"; IFS= read -r line",
        );
        let config = ChannelConfig {
            args: vec!["hello".into()],
            ..ChannelConfig::new(&path)
        }
        .working_dir(dir.path());
        let channel = Channel::spawn("greeter", &config).unwrap();

        let expected = format!("hello {}", dir.path().canonicalize().unwrap().display());
        assert_eq!(channel.exchange("go", SHORT).unwrap(), expected);
    }

    #[test]
    fn overflowing_output_is_dropped_not_buffered() {
        let (_dir, path) = script(
            "chatty",
            "i=0; while [ $i -lt 400 ]; do echo spam; i=$((i+1)); done; echo end; while IFS= read -r line; do echo \"$line\"; done",
        );
        let channel = Channel::spawn("chatty", &ChannelConfig::new(&path)).unwrap();
        thread::sleep(Duration::from_millis(500));

        assert_eq!(channel.lines.len(), LINE_QUEUE_CAPACITY);
        assert_eq!(channel.exchange("ping", SHORT).unwrap(), "ping");
    }

    #[test]
    fn spawn_failure_is_reported() {
        let err = Channel::spawn("ghost", &ChannelConfig::new("/nonexistent/lumen-plugin"))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Spawn { .. }));
    }
}
