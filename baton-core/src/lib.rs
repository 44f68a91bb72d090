//! # Baton Core
//!
//! Self-update engine. An application checks a feed for update tasks,
//! downloads and verifies what they need, and applies them. Files that
//! cannot be replaced while the application runs are finished by a separate
//! updater host, which receives the whole session over a named pipe.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   feed text   ┌─────────────┐   steps + conditions
//! │ UpdateSource │──────────────►│ FeedReader  │──────────────────────┐
//! └──────┬───────┘               └─────────────┘                      ▼
//!        │ files                                            ┌──────────────────┐
//!        └─────────────────────────────────────────────────►│  UpdateManager   │
//!                                                           │ check/prepare/   │
//!                                                           │ apply/rollback   │
//!                                                           └────────┬─────────┘
//!                                      restart required              │
//!                                      ┌─────────────────────────────┘
//!                                      ▼
//!                          ┌────────────────────────┐  SessionContext  ┌──────────────┐
//!                          │ ipc::launch_and_send   │─────────────────►│ updater host │
//!                          └────────────────────────┘   named pipe     └──────────────┘
//! ```

pub mod abort;
pub mod attributes;
pub mod checksum;
pub mod conditions;
pub mod config;
pub mod error;
pub mod feed;
pub mod ipc;
pub mod launcher;
pub mod log;
pub mod manager;
pub mod permissions;
pub mod process;
pub mod session;
pub mod source;
pub mod status;
pub mod steps;
pub mod watch;

pub use abort::AbortHandle;
pub use config::UpdateConfig;
pub use error::{IpcError, Result, UpdateError, WatchError};
pub use feed::{FeedDocument, FeedReader, Registry, XmlFeedReader};
pub use log::{LogItem, Severity, UpdateLog};
pub use manager::{ApplyOptions, ApplyOutcome, ProgressCallback, UpdateManager};
pub use session::SessionContext;
pub use source::{MemorySource, SharedPathSource, UpdateSource, WebSource};
pub use status::{DownloadProgress, ExecutionStatus, ProcessState, UpdateProgress};
pub use steps::{Step, StepContext, StepKind};
