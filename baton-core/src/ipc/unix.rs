//! FIFO transport. The pipe lives at `<temp_dir>/baton-pipe-<sync>`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::stat::Mode;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::{pipe_name, HandoffFailure, OnFailure};
use crate::error::IpcError;
use crate::session::{read_context_from, write_context, SessionContext};

const CONNECT_POLL: Duration = Duration::from_millis(50);

pub(super) fn fifo_path(sync_name: &str) -> PathBuf {
    std::env::temp_dir().join(pipe_name(sync_name))
}

fn create_fifo(path: &Path) -> io::Result<()> {
    let mode = Mode::S_IRUSR | Mode::S_IWUSR;
    match nix::unistd::mkfifo(path, mode) {
        Ok(()) => Ok(()),
        Err(Errno::EEXIST) => {
            // Leftover from a crashed run; the instance lock keeps live runs apart
            warn!(path = %path.display(), "Removing stale pipe");
            std::fs::remove_file(path)?;
            nix::unistd::mkfifo(path, mode).map_err(io::Error::from)
        }
        Err(e) => Err(io::Error::from(e)),
    }
}

pub(super) async fn launch_and_send(
    context: SessionContext,
    mut command: Command,
    sync_name: &str,
    connect_timeout: Duration,
    on_failure: OnFailure,
) -> Result<Child, HandoffFailure> {
    let path = fifo_path(sync_name);
    let name = path.display().to_string();

    if let Err(source) = create_fifo(&path) {
        return Err(HandoffFailure {
            context,
            error: IpcError::Create { name, source },
        });
    }

    let result = send(&context, &mut command, &path, &name, connect_timeout, on_failure).await;
    if let Err(e) = std::fs::remove_file(&path) {
        debug!(path = %name, error = %e, "Failed to remove pipe");
    }

    match result {
        Ok(child) => Ok(child),
        Err(error) => Err(HandoffFailure { context, error }),
    }
}

async fn send(
    context: &SessionContext,
    command: &mut Command,
    path: &Path,
    name: &str,
    connect_timeout: Duration,
    on_failure: OnFailure,
) -> Result<Child, IpcError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let mut child = command.spawn().map_err(|source| IpcError::Spawn {
        program: program.clone(),
        source,
    })?;
    info!(program = %program, pid = ?child.id(), pipe = %name, "Spawned receiver, waiting for connection");

    let deadline = Instant::now() + connect_timeout;
    let mut sender = loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => break sender,
            Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {}
            Err(e) => {
                stop(&mut child, on_failure);
                return Err(IpcError::Io(e));
            }
        }

        if let Ok(Some(status)) = child.try_wait() {
            return Err(IpcError::PeerExited {
                name: name.to_string(),
                status: status.to_string(),
            });
        }
        if Instant::now() >= deadline {
            stop(&mut child, on_failure);
            return Err(IpcError::ConnectTimeout {
                name: name.to_string(),
                timeout: connect_timeout,
            });
        }
        sleep(CONNECT_POLL).await;
    };

    match timeout(connect_timeout, write_context(&mut sender, context)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            stop(&mut child, on_failure);
            return Err(e);
        }
        Err(_) => {
            stop(&mut child, on_failure);
            return Err(IpcError::ConnectTimeout {
                name: name.to_string(),
                timeout: connect_timeout,
            });
        }
    }

    info!(pipe = %name, "Session context sent");
    Ok(child)
}

fn stop(child: &mut Child, on_failure: OnFailure) {
    if on_failure == OnFailure::Kill {
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "Failed to kill receiver");
        }
    }
}

pub(super) async fn read_context(
    sync_name: &str,
    wait: Duration,
) -> Result<Option<SessionContext>, IpcError> {
    let path = fifo_path(sync_name);
    if !path.exists() {
        debug!(path = %path.display(), "No pipe to read from");
        return Ok(None);
    }
    let name = path.display().to_string();

    match timeout(wait, open_and_read(&path)).await {
        Ok(result) => result.map(Some),
        Err(_) => Err(IpcError::ConnectTimeout { name, timeout: wait }),
    }
}

async fn open_and_read(path: &Path) -> Result<SessionContext, IpcError> {
    #[cfg(target_os = "linux")]
    let mut receiver = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)?;

    #[cfg(not(target_os = "linux"))]
    let mut receiver = {
        let blocking_path = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || std::fs::File::open(blocking_path))
            .await
            .map_err(io::Error::other)??;
        pipe::Receiver::from_file(file)?
    };

    read_context_from(&mut receiver).await
}
