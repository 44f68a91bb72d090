//! Named pipe transport at `\\.\pipe\baton-pipe-<sync>`.

use std::io;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{pipe_name, HandoffFailure, OnFailure};
use crate::error::IpcError;
use crate::session::{read_context_from, write_context, SessionContext};

const ERROR_FILE_NOT_FOUND: i32 = 2;

fn pipe_path(sync_name: &str) -> String {
    format!(r"\\.\pipe\{}", pipe_name(sync_name))
}

pub(super) async fn launch_and_send(
    context: SessionContext,
    mut command: Command,
    sync_name: &str,
    connect_timeout: Duration,
    on_failure: OnFailure,
) -> Result<Child, HandoffFailure> {
    match send(&context, &mut command, sync_name, connect_timeout, on_failure).await {
        Ok(child) => Ok(child),
        Err(error) => Err(HandoffFailure { context, error }),
    }
}

async fn send(
    context: &SessionContext,
    command: &mut Command,
    sync_name: &str,
    connect_timeout: Duration,
    on_failure: OnFailure,
) -> Result<Child, IpcError> {
    let name = pipe_path(sync_name);
    let mut server = ServerOptions::new()
        .first_pipe_instance(true)
        .access_inbound(true)
        .access_outbound(true)
        .max_instances(1)
        .create(&name)
        .map_err(|source| IpcError::Create {
            name: name.clone(),
            source,
        })?;

    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let mut child = command.spawn().map_err(|source| IpcError::Spawn {
        program: program.clone(),
        source,
    })?;
    info!(program = %program, pid = ?child.id(), pipe = %name, "Spawned receiver, waiting for connection");

    match timeout(connect_timeout, server.connect()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            stop(&mut child, on_failure);
            return Err(IpcError::Io(e));
        }
        Err(_) => {
            stop(&mut child, on_failure);
            return Err(IpcError::ConnectTimeout {
                name,
                timeout: connect_timeout,
            });
        }
    }

    if let Err(e) = write_context(&mut server, context).await {
        stop(&mut child, on_failure);
        return Err(e);
    }
    wait_for_reader_close(&mut server, &name, connect_timeout).await;

    info!(pipe = %name, "Session context sent");
    Ok(child)
}

/// Block until the reader closes its end.
///
/// Disconnecting the server discards whatever the client has not read yet,
/// so the handle is only dropped once the client is done with it.
async fn wait_for_reader_close(server: &mut NamedPipeServer, name: &str, wait: Duration) {
    let mut byte = [0u8; 1];
    match timeout(wait, server.read(&mut byte)).await {
        Ok(Ok(_)) => debug!(pipe = %name, "Reader closed pipe"),
        Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => debug!(pipe = %name, "Reader closed pipe"),
        Ok(Err(e)) => debug!(pipe = %name, error = %e, "Pipe error after send"),
        Err(_) => warn!(pipe = %name, "Reader still holds the pipe, closing without disconnect"),
    }
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
    let name = pipe_path(sync_name);
    let mut client = match ClientOptions::new().write(false).open(&name) {
        Ok(client) => client,
        Err(e) if e.raw_os_error() == Some(ERROR_FILE_NOT_FOUND) => {
            debug!(pipe = %name, "No pipe to read from");
            return Ok(None);
        }
        Err(e) => return Err(IpcError::Io(e)),
    };

    match timeout(wait, read_context_from(&mut client)).await {
        Ok(result) => result.map(Some),
        Err(_) => Err(IpcError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no session context on {} within {:?}", name, wait),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::sample_context;

    #[tokio::test]
    async fn test_read_without_pipe_returns_none() {
        let sync = format!("missing-{}", uuid::Uuid::new_v4());
        let result = read_context(&sync, Duration::from_millis(100)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_context_larger_than_pipe_buffer_arrives_whole() {
        let sync = format!("large-{}", uuid::Uuid::new_v4());
        let mut context = sample_context();
        context.relaunch_args = (0..4096).map(|i| format!("--argument-{:08}", i)).collect();
        assert!(context.encode().unwrap().len() > 64 * 1024);

        let reader = {
            let sync = sync.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    if let Some(received) = read_context(&sync, Duration::from_secs(5)).await? {
                        return Ok(Some(received));
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Ok::<_, IpcError>(None)
            })
        };

        let mut command = Command::new("cmd");
        command.args(["/C", "ping -n 6 127.0.0.1 >NUL"]);
        let mut child = launch_and_send(context.clone(), command, &sync, Duration::from_secs(5), OnFailure::Kill)
            .await
            .unwrap();
        child.kill().await.unwrap();

        let received = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(received, context);
    }
}
