//! HTTP(S) update source.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use url::{Host, Url};

use super::{destination_for, strip_bom, FetchRequest, ProgressFn, UpdateSource};
use crate::abort::AbortHandle;
use crate::error::{Result, UpdateError};
use crate::status::DownloadProgress;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Whole-request limit for the feed document only
const FEED_TIMEOUT: Duration = Duration::from_secs(300);
/// Longest wait for the next chunk of a download
const STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Fetches the feed and files over HTTP(S)
///
/// Downloads have no overall time limit; they fail only when no data
/// arrives for the stall timeout.
pub struct WebSource {
    feed_url: Url,
    client: reqwest::Client,
    stall_timeout: Duration,
}

impl WebSource {
    /// Create a source for the feed at `feed_url`
    pub fn new(feed_url: &str) -> Result<Self> {
        Self::with_proxy(feed_url, None)
    }

    /// Create a source that sends every request through `proxy`
    pub fn with_proxy(feed_url: &str, proxy: Option<&str>) -> Result<Self> {
        let parsed = Url::parse(feed_url).map_err(|e| {
            UpdateError::Configuration(format!("Invalid feed URL '{}': {}", feed_url, e))
        })?;

        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            feed_url: parsed,
            client: builder.build()?,
            stall_timeout: STALL_TIMEOUT,
        })
    }

    /// Override how long a download may go without receiving data
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    pub fn feed_url(&self) -> &Url {
        &self.feed_url
    }

    /// Resolve a file reference against the base URL, or the feed URL when no
    /// base URL is known.
    fn resolve_file_url(&self, url: &str, base_url: Option<&str>) -> Result<Url> {
        if let Ok(absolute) = Url::parse(url) {
            return Ok(absolute);
        }

        let joined = match base_url.filter(|b| !b.is_empty()) {
            Some(base) => {
                // without the trailing slash the last path segment is dropped
                let base = if base.ends_with('/') {
                    base.to_string()
                } else {
                    format!("{}/", base)
                };
                Url::parse(&base).and_then(|b| b.join(url))
            }
            None => self.feed_url.join(url),
        };

        joined.map_err(|e| UpdateError::Configuration(format!("Invalid file URL '{}': {}", url, e)))
    }
}

/// Resolve the host up front so connectivity problems surface immediately.
async fn resolve_host(url: &Url) -> Result<()> {
    let domain = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(_) => return Ok(()),
        None => {
            return Err(UpdateError::Configuration(format!("URL has no host: {}", url)));
        }
    };
    let port = url.port_or_known_default().unwrap_or(80);

    let mut addrs = tokio::net::lookup_host((domain.as_str(), port))
        .await
        .map_err(|source| UpdateError::Dns {
            host: domain.clone(),
            source,
        })?;

    if addrs.next().is_none() {
        return Err(UpdateError::Dns {
            host: domain.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses returned"),
        });
    }

    Ok(())
}

#[async_trait]
impl UpdateSource for WebSource {
    #[instrument(skip(self), fields(url = %self.feed_url))]
    async fn fetch_feed(&self) -> Result<String> {
        resolve_host(&self.feed_url).await?;

        info!("Fetching update feed");
        let response = self
            .client
            .get(self.feed_url.clone())
            .timeout(FEED_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Transport(format!(
                "Feed request to {} returned {}",
                self.feed_url, status
            )));
        }

        let text = response.text().await?;
        debug!(bytes = text.len(), "Feed fetched");
        Ok(strip_bom(&text).to_string())
    }

    #[instrument(skip(self, request, progress, abort), fields(url = %request.url))]
    async fn fetch_file(
        &self,
        request: FetchRequest,
        progress: &ProgressFn,
        abort: &AbortHandle,
    ) -> Result<PathBuf> {
        let url = self.resolve_file_url(&request.url, request.base_url.as_deref())?;
        resolve_host(&url).await?;

        let dest = destination_for(request.temp_path);
        info!(url = %url, dest = %dest.display(), "Downloading file");

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Transport(format!(
                "Download of {} failed with status {}",
                url, status
            )));
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(&dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_report: Option<Instant> = None;

        loop {
            let chunk = match tokio::time::timeout(self.stall_timeout, stream.next()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(_) => {
                    warn!(url = %url, downloaded, "Download stalled, abandoning temp file");
                    return Err(UpdateError::Transport(format!(
                        "Download of {} stalled: no data for {:?} after {} bytes",
                        url, self.stall_timeout, downloaded
                    )));
                }
            };
            if abort.is_aborted() {
                warn!(url = %url, downloaded, "Download aborted, abandoning temp file");
                return Err(UpdateError::Aborted);
            }

            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if last_report.map_or(true, |t| t.elapsed() >= REPORT_INTERVAL) {
                progress(DownloadProgress::new(downloaded, total.unwrap_or(0)));
                last_report = Some(Instant::now());
            }
        }

        file.flush().await?;
        progress(DownloadProgress::new(downloaded, total.unwrap_or(downloaded)));

        if let Some(total) = total {
            if downloaded != total {
                return Err(UpdateError::Transport(format!(
                    "Incomplete download of {}: got {} of {} bytes",
                    url, downloaded, total
                )));
            }
        }

        info!(url = %url, bytes = downloaded, "Download complete");
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve a single HTTP response on a random local port.
    async fn serve_once(body: &'static [u8], declared_len: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                declared_len
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.ok();
        });

        format!("http://{}", addr)
    }

    /// Serve `chunks` with `gap` between them, then hold the connection
    /// open for `hold` before closing.
    async fn serve_slowly(chunks: Vec<&'static [u8]>, gap: Duration, hold: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let declared_len: usize = chunks.iter().map(|c| c.len()).sum();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                declared_len
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            for (i, chunk) in chunks.iter().enumerate() {
                if i + 1 == chunks.len() {
                    tokio::time::sleep(hold).await;
                }
                socket.write_all(chunk).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(gap).await;
            }
            socket.shutdown().await.ok();
        });

        format!("http://{}", addr)
    }

    fn request() -> FetchRequest {
        FetchRequest {
            url: "app.bin".into(),
            base_url: None,
            temp_path: None,
        }
    }

    #[test]
    fn test_relative_url_joins_against_base_with_trailing_slash() {
        let source = WebSource::new("https://updates.example.com/feeds/feed.xml").unwrap();

        let url = source
            .resolve_file_url("app.bin", Some("https://cdn.example.com/releases/1.2"))
            .unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/releases/1.2/app.bin");

        let url = source.resolve_file_url("lib/core.so", None).unwrap();
        assert_eq!(url.as_str(), "https://updates.example.com/feeds/lib/core.so");

        let url = source
            .resolve_file_url("https://mirror.example.com/x.bin", Some("https://cdn.example.com/"))
            .unwrap();
        assert_eq!(url.as_str(), "https://mirror.example.com/x.bin");
    }

    #[test]
    fn test_invalid_feed_url_is_configuration_error() {
        assert!(matches!(
            WebSource::new("not a url"),
            Err(UpdateError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_host_fails_fast_as_dns_error() {
        let source = WebSource::new("http://baton-update.invalid/feed.xml").unwrap();
        let err = source.fetch_feed().await.unwrap_err();
        assert!(matches!(err, UpdateError::Dns { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_fetch_file_writes_to_requested_temp_path() {
        let base = serve_once(b"new binary", 10).await;
        let source = WebSource::new(&format!("{}/feed.xml", base)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let wanted = dir.path().join("download.tmp");

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let progress = move |p: DownloadProgress| sink.lock().unwrap().push(p);

        let path = source
            .fetch_file(
                FetchRequest {
                    url: "app.bin".into(),
                    base_url: Some(base),
                    temp_path: Some(wanted.clone()),
                },
                &progress,
                &AbortHandle::new(),
            )
            .await
            .unwrap();

        assert_eq!(path, wanted);
        assert_eq!(std::fs::read(&path).unwrap(), b"new binary");
        let last = reports.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.percentage, 100);
    }

    #[tokio::test]
    async fn test_short_body_is_incomplete_download() {
        let base = serve_once(b"short", 64).await;
        let source = WebSource::new(&format!("{}/feed.xml", base)).unwrap();

        let result = source
            .fetch_file(
                FetchRequest {
                    url: "app.bin".into(),
                    base_url: None,
                    temp_path: None,
                },
                &|_| {},
                &AbortHandle::new(),
            )
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_slow_download_outlasting_stall_timeout_completes() {
        let chunks: Vec<&'static [u8]> = vec![b"aa", b"bb", b"cc", b"dd", b"ee", b"ff"];
        let base = serve_slowly(chunks, Duration::from_millis(150), Duration::ZERO).await;
        let source = WebSource::new(&format!("{}/feed.xml", base))
            .unwrap()
            .with_stall_timeout(Duration::from_millis(500));

        let path = source.fetch_file(request(), &|_| {}, &AbortHandle::new()).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"aabbccddeeff");
    }

    #[tokio::test]
    async fn test_stalled_download_fails() {
        let chunks: Vec<&'static [u8]> = vec![b"first", b"never"];
        let base = serve_slowly(chunks, Duration::ZERO, Duration::from_secs(5)).await;
        let source = WebSource::new(&format!("{}/feed.xml", base))
            .unwrap()
            .with_stall_timeout(Duration::from_millis(300));

        let err = source.fetch_file(request(), &|_| {}, &AbortHandle::new()).await.unwrap_err();
        assert!(matches!(&err, UpdateError::Transport(msg) if msg.contains("stalled")), "got {err:?}");
    }
}
