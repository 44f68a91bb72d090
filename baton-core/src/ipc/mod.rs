//! # Cross-Process Handoff
//!
//! Moves a [`SessionContext`] from one process to a freshly spawned one over
//! a named pipe. The sender creates the endpoint before spawning the
//! receiver, waits a bounded time for it to connect, writes a single frame and
//! tears the pipe down.
//!
//! ```text
//! application                              updater host
//! ───────────                              ────────────
//! create pipe "baton-pipe-<sync>"
//! spawn host  ───────────────────────────► start
//! wait for peer (timeout)  ◄─────────────  open pipe for reading
//! write frame ───────────────────────────► read_context()
//! close, exit                              wait for instance lock release
//! ```
//!
//! Ownership of the context moves with the call: on success it is gone from
//! the sender, on failure it is handed back unchanged inside
//! [`HandoffFailure`].

mod instance_lock;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub use instance_lock::InstanceLock;

use std::fmt;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::IpcError;
use crate::session::SessionContext;

/// Prefix of every pipe name
pub const PIPE_PREFIX: &str = "baton-pipe-";

/// Keep only characters that are safe in file and pipe names.
pub(crate) fn sanitize(sync_name: &str) -> String {
    sync_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

/// Pipe name for a synchronisation name
pub fn pipe_name(sync_name: &str) -> String {
    format!("{}{}", PIPE_PREFIX, sanitize(sync_name))
}

/// A failed handoff. The context is returned untouched.
#[derive(Debug)]
pub struct HandoffFailure {
    pub context: SessionContext,
    pub error: IpcError,
}

impl fmt::Display for HandoffFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handoff failed: {}", self.error)
    }
}

impl std::error::Error for HandoffFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// What happens to the spawned process when the handoff fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnFailure {
    Kill,
    Detach,
}

/// Create the pipe, spawn `command` and send it `context`.
///
/// Returns the child process once the frame has been written. If the
/// handoff fails the child is killed.
pub async fn launch_and_send(
    context: SessionContext,
    command: Command,
    sync_name: &str,
    connect_timeout: Duration,
) -> Result<Child, HandoffFailure> {
    launch(context, command, sync_name, connect_timeout, OnFailure::Kill).await
}

/// Like [`launch_and_send`], but a child that never connects keeps running.
///
/// Used when relaunching an application that may not pick up the session.
pub async fn launch_and_offer(
    context: SessionContext,
    command: Command,
    sync_name: &str,
    connect_timeout: Duration,
) -> Result<Child, HandoffFailure> {
    launch(context, command, sync_name, connect_timeout, OnFailure::Detach).await
}

async fn launch(
    context: SessionContext,
    command: Command,
    sync_name: &str,
    connect_timeout: Duration,
    on_failure: OnFailure,
) -> Result<Child, HandoffFailure> {
    #[cfg(unix)]
    {
        unix::launch_and_send(context, command, sync_name, connect_timeout, on_failure).await
    }
    #[cfg(windows)]
    {
        windows::launch_and_send(context, command, sync_name, connect_timeout, on_failure).await
    }
}

/// Receive a context sent to `sync_name`.
///
/// `Ok(None)` means nobody created a pipe for this name.
pub async fn read_context(
    sync_name: &str,
    timeout: Duration,
) -> Result<Option<SessionContext>, IpcError> {
    #[cfg(unix)]
    {
        unix::read_context(sync_name, timeout).await
    }
    #[cfg(windows)]
    {
        windows::read_context(sync_name, timeout).await
    }
}
