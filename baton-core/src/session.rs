//! Session context
//!
//! The complete state of an update attempt as it crosses the process
//! boundary: resolved configuration, every step with its runtime state and
//! status, relaunch settings and the update log.
//!
//! ## Wire format
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────┐
//! │ len: u32 BE  │ postcard(SessionContext)         │
//! └──────────────┴──────────────────────────────────┘
//! ```
//!
//! `format_version` is the first field of the payload and is checked before
//! the rest is decoded.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::config::UpdateConfig;
use crate::error::IpcError;
use crate::log::LogItem;
use crate::steps::Step;

/// Bumped whenever the serialized layout changes
pub const SESSION_FORMAT_VERSION: u32 = 1;

/// Maximum frame payload size (64MB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub format_version: u32,
    pub config: UpdateConfig,
    pub steps: Vec<Step>,
    /// Executable of the application that started the update
    pub app_path: PathBuf,
    pub working_directory: PathBuf,
    pub relaunch_application: bool,
    pub relaunch_args: Vec<String>,
    pub base_url: Option<String>,
    pub log_items: Vec<LogItem>,
}

impl SessionContext {
    pub fn encode(&self) -> Result<Vec<u8>, IpcError> {
        postcard::to_stdvec(self).map_err(IpcError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IpcError> {
        let (found, _) = postcard::take_from_bytes::<u32>(bytes).map_err(IpcError::Decode)?;
        if found != SESSION_FORMAT_VERSION {
            return Err(IpcError::Version {
                found,
                expected: SESSION_FORMAT_VERSION,
            });
        }
        postcard::from_bytes(bytes).map_err(IpcError::Decode)
    }

    /// Folder the application lives in
    pub fn app_dir(&self) -> PathBuf {
        self.app_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.working_directory.clone())
    }
}

/// Write a length-prefixed session context to the stream.
pub async fn write_context<W>(writer: &mut W, context: &SessionContext) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let payload = context.encode()?;
    let len = payload.len();
    trace!(length = len, "Writing session context");

    if len > MAX_MESSAGE_SIZE {
        return Err(IpcError::TooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    writer.write_all(&(len as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;

    debug!(length = len, steps = context.steps.len(), "Session context written");
    Ok(())
}

/// Read a length-prefixed session context from the stream.
pub async fn read_context_from<R>(reader: &mut R) -> Result<SessionContext, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    trace!(length = len, "Reading session context");

    if len > MAX_MESSAGE_SIZE {
        return Err(IpcError::TooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let context = SessionContext::decode(&payload)?;
    debug!(length = len, steps = context.steps.len(), "Session context received");
    Ok(context)
}
