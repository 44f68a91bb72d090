//! Watchdog launcher.
//!
//! Starts `baton-watchdog <self-pid> <child-pid>...` for a set of children.
//! The watchdog is a separate process and keeps running if this one dies,
//! killing the children it was given.
//!
//! ```text
//! start_and_watch(commands)
//!   ├── spawn each command (stdout/stderr piped)
//!   │     └── failure: kill the ones already started, return
//!   ├── relay output lines ──► tracing + OutputLine channel
//!   └── spawn baton-watchdog <self> <children...>
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::WatchError;
use crate::process::{ProcessIdentity, ProcessTable};

/// Binary name of the watchdog next to the application
pub const WATCHDOG_BINARY: &str = "baton-watchdog";

/// Default watchdog location: next to the current executable.
pub fn default_watchdog_path() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "executable has no parent directory")
    })?;
    Ok(dir.join(format!("{}{}", WATCHDOG_BINARY, std::env::consts::EXE_SUFFIX)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line written by a started child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub pid: u32,
    pub stream: OutputStream,
    pub line: String,
}

/// A running watchdog and the processes it guards
#[derive(Debug)]
pub struct ProcessWatch {
    watchdog: Child,
    children: Vec<u32>,
    identities: Vec<ProcessIdentity>,
    owned: Vec<Child>,
    relays: Vec<JoinHandle<()>>,
    output: Option<mpsc::UnboundedReceiver<OutputLine>>,
}

fn spawn_watchdog(watchdog_path: &Path, children: &[u32]) -> Result<Child, WatchError> {
    Command::new(watchdog_path)
        .arg(std::process::id().to_string())
        .args(children.iter().map(u32::to_string))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| WatchError::Watchdog {
            path: watchdog_path.to_path_buf(),
            source,
        })
}

fn relay<R>(reader: R, pid: u32, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!(pid, stream = ?stream, "{}", line);
                    // The receiver may have been dropped; logging still happens
                    let _ = tx.send(OutputLine { pid, stream, line });
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(pid, stream = ?stream, error = %e, "Output relay stopped");
                    break;
                }
            }
        }
    })
}

/// Kill and reap children started so far. Returns their PIDs.
async fn stop_all(children: &mut [Child]) -> Vec<u32> {
    let mut stopped = Vec::new();
    for child in children.iter_mut() {
        if let Some(pid) = child.id() {
            stopped.push(pid);
        }
        if matches!(child.try_wait(), Ok(Some(_))) {
            continue;
        }
        if let Err(e) = child.kill().await {
            warn!(pid = ?child.id(), error = %e, "Failed to kill started process");
        }
    }
    stopped
}

impl ProcessWatch {
    /// Spawn the watchdog for children that are already running.
    pub fn start(watchdog_path: &Path, children: &[u32]) -> Result<Self, WatchError> {
        if children.is_empty() {
            return Err(WatchError::Empty);
        }

        let mut table = ProcessTable::new();
        let identities = children.iter().filter_map(|&pid| table.identify(pid)).collect();
        let watchdog = spawn_watchdog(watchdog_path, children)?;

        info!(watchdog_pid = ?watchdog.id(), children = ?children, "Process watchdog started");
        Ok(Self {
            watchdog,
            children: children.to_vec(),
            identities,
            owned: Vec::new(),
            relays: Vec::new(),
            output: None,
        })
    }

    /// Start every command, relay its output, and put them all under a
    /// watchdog. If any command or the watchdog fails to start, the children
    /// started so far are killed.
    #[instrument(skip_all, fields(count = commands.len()))]
    pub async fn start_and_watch(watchdog_path: &Path, commands: Vec<Command>) -> Result<Self, WatchError> {
        if commands.is_empty() {
            return Err(WatchError::Empty);
        }

        let mut owned: Vec<Child> = Vec::with_capacity(commands.len());
        for mut command in commands {
            let program = command.as_std().get_program().to_string_lossy().into_owned();
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            match command.spawn() {
                Ok(child) => {
                    debug!(program = %program, pid = ?child.id(), "Started watched process");
                    owned.push(child);
                }
                Err(source) => {
                    let stopped = stop_all(&mut owned).await;
                    warn!(program = %program, error = %source, stopped = ?stopped, "Start failed, stopped started processes");
                    return Err(WatchError::Spawn {
                        program,
                        stopped,
                        source,
                    });
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut relays = Vec::new();
        let mut children = Vec::new();
        for child in &mut owned {
            let Some(pid) = child.id() else { continue };
            children.push(pid);
            if let Some(stdout) = child.stdout.take() {
                relays.push(relay(stdout, pid, OutputStream::Stdout, tx.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                relays.push(relay(stderr, pid, OutputStream::Stderr, tx.clone()));
            }
        }

        let watchdog = match spawn_watchdog(watchdog_path, &children) {
            Ok(watchdog) => watchdog,
            Err(e) => {
                stop_all(&mut owned).await;
                return Err(e);
            }
        };

        let mut table = ProcessTable::new();
        let identities = children.iter().filter_map(|&pid| table.identify(pid)).collect();

        info!(watchdog_pid = ?watchdog.id(), children = ?children, "Started processes under watchdog");
        Ok(Self {
            watchdog,
            children,
            identities,
            owned,
            relays,
            output: Some(rx),
        })
    }

    pub fn children(&self) -> &[u32] {
        &self.children
    }

    pub fn watchdog_pid(&self) -> Option<u32> {
        self.watchdog.id()
    }

    /// Output lines of children started by [`ProcessWatch::start_and_watch`].
    /// Can be taken once.
    pub fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<OutputLine>> {
        self.output.take()
    }

    /// Whether any watched child is still running.
    pub fn any_alive(&mut self) -> bool {
        for child in &mut self.owned {
            if matches!(child.try_wait(), Ok(None)) {
                return true;
            }
        }
        let mut table = ProcessTable::new();
        self.identities
            .iter()
            .filter(|id| !self.owned.iter().any(|c| c.id() == Some(id.pid)))
            .any(|id| table.is_same_alive(id))
    }

    /// Kill every watched child and the watchdog.
    pub async fn force_exit(&mut self) {
        stop_all(&mut self.owned).await;

        let mut table = ProcessTable::new();
        for identity in &self.identities {
            if table.is_same_alive(identity) && !table.kill(identity) {
                warn!(pid = identity.pid, "Failed to kill watched process");
            }
        }
        if let Err(e) = self.watchdog.kill().await {
            warn!(error = %e, "Failed to stop watchdog");
        }
    }

    /// Wait up to `timeout` for the watched children to exit, then kill
    /// whatever is left. Returns true if everything exited on its own.
    #[instrument(skip(self), fields(children = ?self.children))]
    pub async fn wait_timeout_then_force_exit(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let exited = loop {
            if !self.any_alive() {
                // The watchdog exits on its own once the children are gone
                let _ = tokio::time::timeout(Duration::from_secs(2), self.watchdog.wait()).await;
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                info!("Watched processes still running, forcing exit");
                self.force_exit().await;
                break false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        };

        for relay in self.relays.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(1), relay).await;
        }
        exited
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn test_start_rejects_empty_children() {
        let err = ProcessWatch::start(Path::new("sleep"), &[]).unwrap_err();
        assert!(matches!(err, WatchError::Empty));
    }

    #[tokio::test]
    async fn test_force_exit_after_timeout() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        // `sleep` stands in for the watchdog binary
        let mut watch = ProcessWatch::start(Path::new("sleep"), &[child.id()]).unwrap();

        let exited = watch.wait_timeout_then_force_exit(Duration::from_millis(300)).await;
        assert!(!exited);
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_start_and_watch_relays_output() {
        let commands = vec![sh("echo hello; echo oops >&2"), sh("echo second")];
        let mut watch = ProcessWatch::start_and_watch(Path::new("sleep"), commands).await.unwrap();
        let mut output = watch.take_output().unwrap();
        assert_eq!(watch.children().len(), 2);

        assert!(watch.wait_timeout_then_force_exit(Duration::from_secs(5)).await);
        watch.force_exit().await;
        drop(watch);

        let mut lines = Vec::new();
        while let Some(line) = output.recv().await {
            lines.push((line.stream, line.line));
        }
        lines.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            lines,
            vec![
                (OutputStream::Stdout, "hello".to_string()),
                (OutputStream::Stderr, "oops".to_string()),
                (OutputStream::Stdout, "second".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_partial_start_failure_kills_started_children() {
        let commands = vec![
            sh("sleep 30"),
            sh("sleep 30"),
            Command::new("/nonexistent/baton-child"),
        ];
        let err = ProcessWatch::start_and_watch(Path::new("sleep"), commands).await.unwrap_err();

        let WatchError::Spawn { stopped, program, .. } = err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(program, "/nonexistent/baton-child");
        assert_eq!(stopped.len(), 2);

        let mut table = ProcessTable::new();
        for pid in stopped {
            assert!(!table.is_alive(pid));
        }
    }

    #[tokio::test]
    async fn test_watchdog_start_failure_kills_children() {
        let err = ProcessWatch::start_and_watch(Path::new("/nonexistent/baton-watchdog"), vec![sh("sleep 30")])
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Watchdog { .. }));
    }
}
