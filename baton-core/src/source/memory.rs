//! In-memory update source.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{destination_for, FetchRequest, ProgressFn, UpdateSource};
use crate::abort::AbortHandle;
use crate::error::{Result, UpdateError};
use crate::status::DownloadProgress;

/// Serves a fixed feed and a map of file name to contents
#[derive(Debug, Default)]
pub struct MemorySource {
    feed: String,
    files: HashMap<String, Vec<u8>>,
    fetched: Mutex<Vec<String>>,
}

impl MemorySource {
    pub fn new(feed: impl Into<String>) -> Self {
        Self {
            feed: feed.into(),
            ..Default::default()
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), contents.into());
        self
    }

    /// Names requested through `fetch_file`, in order
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl UpdateSource for MemorySource {
    async fn fetch_feed(&self) -> Result<String> {
        Ok(self.feed.clone())
    }

    async fn fetch_file(
        &self,
        request: FetchRequest,
        progress: &ProgressFn,
        abort: &AbortHandle,
    ) -> Result<PathBuf> {
        if abort.is_aborted() {
            return Err(UpdateError::Aborted);
        }
        if let Ok(mut fetched) = self.fetched.lock() {
            fetched.push(request.url.clone());
        }

        let contents = self
            .files
            .get(&request.url)
            .ok_or_else(|| UpdateError::Transport(format!("{} not found", request.url)))?;

        let dest = destination_for(request.temp_path);
        tokio::fs::write(&dest, contents).await?;
        let len = contents.len() as u64;
        progress(DownloadProgress::new(len, len));

        Ok(dest)
    }
}
