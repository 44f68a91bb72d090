//! Error types for the update engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while checking, preparing or applying updates.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// A phase was invoked out of order.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Host name resolution failed before any request was made.
    #[error("Failed to resolve {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// Download or request failure.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Downloaded file does not match the expected checksum.
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Feed document could not be parsed.
    #[error("Failed to parse feed: {0}")]
    Feed(String),

    /// A step failed during the prepare phase.
    #[error("Step '{step}' failed to prepare: {source}")]
    Prepare {
        step: String,
        #[source]
        source: Box<UpdateError>,
    },

    /// A step failed while executing; the OS error is preserved.
    #[error("Step '{step}' failed: {source}")]
    Execute {
        step: String,
        #[source]
        source: std::io::Error,
    },

    /// A step reported a non-successful status during apply.
    #[error("Step '{step}' did not complete: {status}")]
    StepFailed { step: String, status: String },

    /// Rollback was requested but the recorded backup no longer exists.
    #[error("Backup file {0} is missing, cannot roll back")]
    BackupMissing(PathBuf),

    #[error("Rollback of '{step}' failed: {source}")]
    Rollback {
        step: String,
        #[source]
        source: std::io::Error,
    },

    /// The abort flag was raised.
    #[error("Update aborted by user")]
    Aborted,

    /// Cross-process handoff failure.
    #[error("Handoff failed: {0}")]
    Ipc(#[from] IpcError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the named-pipe handoff and the instance lock.
#[derive(Error, Debug)]
pub enum IpcError {
    /// The pipe endpoint could not be created.
    #[error("Failed to create pipe {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The peer never opened its end of the pipe.
    #[error("Peer did not connect to {name} within {timeout:?}")]
    ConnectTimeout { name: String, timeout: Duration },

    /// The spawned process exited before connecting.
    #[error("Process exited before connecting to {name}: {status}")]
    PeerExited { name: String, status: String },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode session context: {0}")]
    Encode(#[source] postcard::Error),

    #[error("Failed to decode session context: {0}")]
    Decode(#[source] postcard::Error),

    /// The peer speaks a different session format.
    #[error("Unsupported session format {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    /// Another process already holds the instance lock.
    #[error("Instance lock {0} is held by another process")]
    Locked(String),

    /// Timed out waiting for the other process to release the instance lock.
    #[error("Instance lock {name} still held after {timeout:?}")]
    LockTimeout { name: String, timeout: Duration },

    #[error("Pipe I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors starting a process watch.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("No processes to watch")]
    Empty,

    /// A child failed to start; the ones started before it were killed.
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        stopped: Vec<u32>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start watchdog {path}: {source}")]
    Watchdog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for update operations.
pub type Result<T> = std::result::Result<T, UpdateError>;
