//! Update sources
//!
//! A source fetches the feed document and the files it references. Three
//! implementations share one contract:
//! - [`WebSource`]: HTTP(S) with eager DNS resolution and optional proxy
//! - [`SharedPathSource`]: plain file copies from a local or network path
//! - [`MemorySource`]: in-memory feed and files

mod memory;
mod shared_path;
mod web;

pub use memory::MemorySource;
pub use shared_path::SharedPathSource;
pub use web::WebSource;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::abort::AbortHandle;
use crate::error::Result;
use crate::status::DownloadProgress;

/// Progress callback invoked while a file is transferred
pub type ProgressFn = dyn Fn(DownloadProgress) + Send + Sync;

/// A single file request
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Absolute URL/path, or one relative to `base_url`
    pub url: String,
    pub base_url: Option<String>,
    /// Preferred destination. When unset, or when its folder does not
    /// exist, the source allocates a fresh temp file.
    pub temp_path: Option<PathBuf>,
}

/// Where update data comes from
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Fetch the feed document as text.
    async fn fetch_feed(&self) -> Result<String>;

    /// Fetch one file and return the path it was written to.
    ///
    /// A raised abort flag stops the transfer with `UpdateError::Aborted`;
    /// the partially written file is left behind.
    async fn fetch_file(
        &self,
        request: FetchRequest,
        progress: &ProgressFn,
        abort: &AbortHandle,
    ) -> Result<PathBuf>;
}

/// Pick the destination for a download.
pub(crate) fn destination_for(temp_path: Option<PathBuf>) -> PathBuf {
    match temp_path {
        Some(path) if path.parent().map(Path::is_dir).unwrap_or(false) => path,
        _ => std::env::temp_dir().join(format!("baton-{}.tmp", uuid::Uuid::new_v4())),
    }
}

/// Drop a leading UTF-8 byte-order mark.
pub(crate) fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}
