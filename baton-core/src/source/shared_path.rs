//! Update source reading from a local folder or network share.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, instrument};
use url::Url;

use super::{destination_for, strip_bom, FetchRequest, ProgressFn, UpdateSource};
use crate::abort::AbortHandle;
use crate::error::{Result, UpdateError};
use crate::status::DownloadProgress;

/// Reads the feed and files straight from the file system
pub struct SharedPathSource {
    feed_path: PathBuf,
}

impl SharedPathSource {
    pub fn new(feed_path: impl Into<PathBuf>) -> Self {
        Self {
            feed_path: feed_path.into(),
        }
    }

    fn resolve_file_path(&self, url: &str, base_url: Option<&str>) -> PathBuf {
        let requested = to_path(url);
        if requested.is_absolute() {
            return requested;
        }

        let base = match base_url.filter(|b| !b.is_empty()) {
            Some(base) => to_path(base),
            None => self
                .feed_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        };
        base.join(requested)
    }
}

/// Accept both plain paths and `file://` URLs.
fn to_path(value: &str) -> PathBuf {
    if value.starts_with("file:") {
        if let Some(path) = Url::parse(value).ok().and_then(|u| u.to_file_path().ok()) {
            return path;
        }
    }
    PathBuf::from(value)
}

#[async_trait]
impl UpdateSource for SharedPathSource {
    #[instrument(skip(self), fields(path = %self.feed_path.display()))]
    async fn fetch_feed(&self) -> Result<String> {
        let bytes = tokio::fs::read(&self.feed_path).await?;
        let text = String::from_utf8(bytes)
            .map_err(|e| UpdateError::Feed(format!("Feed is not valid UTF-8: {}", e)))?;
        Ok(strip_bom(&text).to_string())
    }

    #[instrument(skip(self, request, progress, abort), fields(url = %request.url))]
    async fn fetch_file(
        &self,
        request: FetchRequest,
        progress: &ProgressFn,
        abort: &AbortHandle,
    ) -> Result<PathBuf> {
        if abort.is_aborted() {
            return Err(UpdateError::Aborted);
        }

        let src = self.resolve_file_path(&request.url, request.base_url.as_deref());
        let dest = destination_for(request.temp_path);
        info!(src = %src.display(), dest = %dest.display(), "Copying file");

        let copied = tokio::fs::copy(&src, &dest).await?;
        progress(DownloadProgress::new(copied, copied));

        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_bom_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let feed = dir.path().join("feed.xml");
        std::fs::write(&feed, b"\xEF\xBB\xBF<Feed><Tasks/></Feed>").unwrap();

        let source = SharedPathSource::new(&feed);
        assert_eq!(source.fetch_feed().await.unwrap(), "<Feed><Tasks/></Feed>");
    }

    #[tokio::test]
    async fn test_relative_file_resolves_next_to_feed() {
        let share = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(share.path().join("bin")).unwrap();
        std::fs::write(share.path().join("bin/app"), b"v2").unwrap();
        let source = SharedPathSource::new(share.path().join("feed.xml"));

        let staging = tempfile::tempdir().unwrap();
        let path = source
            .fetch_file(
                FetchRequest {
                    url: "bin/app".into(),
                    base_url: None,
                    temp_path: Some(staging.path().join("app.tmp")),
                },
                &|_| {},
                &AbortHandle::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_aborted_before_copy() {
        let source = SharedPathSource::new("/nonexistent/feed.xml");
        let abort = AbortHandle::new();
        abort.abort();

        let result = source
            .fetch_file(
                FetchRequest {
                    url: "x".into(),
                    base_url: None,
                    temp_path: None,
                },
                &|_| {},
                &abort,
            )
            .await;
        assert!(matches!(result, Err(UpdateError::Aborted)));
    }
}
