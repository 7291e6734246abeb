//! Bounded-concurrency photo download.

use crate::feed::PhotoReference;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const POST_URL_PREFIX: &str = "https:##www.instagram.com#p#";
const STORED_SUFFIX: &str = "#.jpeg";

#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("cannot create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a single photo was not stored.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("download pool closed")]
    Closed,
}

/// One finished download, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub directory: PathBuf,
    pub downloaded: usize,
    pub failed: usize,
    /// Files written by this call, in completion order.
    pub stored: Vec<PathBuf>,
}

/// How many of `count` photos to fetch; a negative limit means all.
pub fn select_limit(count: usize, limit: i64) -> usize {
    match usize::try_from(limit) {
        Ok(limit) => limit.min(count),
        Err(_) => count,
    }
}

/// File name for a downloaded photo. The digest keeps carousel siblings
/// apart; the remainder encodes the post URL with `/` written as `#`.
pub fn stored_file_name(reference: &PhotoReference) -> String {
    let digest = Sha256::digest(reference.download_url.as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{hex}__{POST_URL_PREFIX}{}{STORED_SUFFIX}", reference.post_code)
}

/// Recover the post URL from a stored file name.
pub fn post_url(file_name: &str) -> Option<String> {
    let (_, encoded) = file_name.split_once("__")?;
    let encoded = encoded.strip_suffix(".jpeg")?;
    Some(encoded.replace('#', "/"))
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn fetch(client: &Client, url: &str, path: &Path) -> Result<usize, FetchError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status(status));
    }
    let bytes = response.bytes().await?;
    let partial = partial_path(path);
    tokio::fs::write(&partial, &bytes).await?;
    tokio::fs::rename(&partial, path).await?;
    Ok(bytes.len())
}

pub struct DownloadCoordinator {
    client: Client,
    options: DownloadOptions,
}

impl DownloadCoordinator {
    pub fn new(client: Client, options: DownloadOptions) -> Self {
        Self { client, options }
    }

    /// Fetch up to `limit` photos into `dest_dir`. Individual failures are
    /// counted, never fatal. `on_progress` sees completions in the order they
    /// finish.
    #[instrument(skip(self, references, on_progress), fields(count = references.len()))]
    pub async fn download_all<F>(
        &self,
        references: &[PhotoReference],
        dest_dir: &Path,
        limit: i64,
        mut on_progress: F,
    ) -> Result<DownloadReport, DownloadError>
    where
        F: FnMut(Progress),
    {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| DownloadError::CreateDir {
                path: dest_dir.to_path_buf(),
                source,
            })?;

        let selected = &references[..select_limit(references.len(), limit)];
        let total = selected.len();
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let timeout = self.options.timeout;
        let mut tasks = JoinSet::new();

        for reference in selected {
            let client = self.client.clone();
            let semaphore = Arc::clone(&semaphore);
            let url = reference.download_url.clone();
            let path = dest_dir.join(stored_file_name(reference));
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => match tokio::time::timeout(timeout, fetch(&client, &url, &path)).await {
                        Ok(result) => result,
                        Err(_) => Err(FetchError::Timeout(timeout)),
                    },
                    Err(_) => Err(FetchError::Closed),
                };
                (url, path, result)
            });
        }

        let mut report = DownloadReport {
            directory: dest_dir.to_path_buf(),
            downloaded: 0,
            failed: 0,
            stored: Vec::new(),
        };
        let mut completed = 0;
        while let Some(joined) = tasks.join_next().await {
            completed += 1;
            let url = match joined {
                Ok((url, path, Ok(bytes))) => {
                    report.downloaded += 1;
                    debug!(%url, path = %path.display(), bytes, "downloaded photo");
                    report.stored.push(path);
                    url
                }
                Ok((url, path, Err(e))) => {
                    report.failed += 1;
                    warn!(%url, error = %e, "photo download failed");
                    let _ = tokio::fs::remove_file(partial_path(&path)).await;
                    url
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, "download task aborted");
                    String::new()
                }
            };
            on_progress(Progress { completed, total, url });
        }

        info!(downloaded = report.downloaded, failed = report.failed, "download finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use tempfile::TempDir;

    fn reference(url: String, code: &str) -> PhotoReference {
        PhotoReference {
            download_url: url,
            post_code: code.into(),
        }
    }

    fn coordinator(timeout: Duration) -> DownloadCoordinator {
        DownloadCoordinator::new(
            Client::new(),
            DownloadOptions {
                concurrency: 2,
                timeout,
            },
        )
    }

    #[test]
    fn test_select_limit() {
        assert_eq!(select_limit(10, -1), 10);
        assert_eq!(select_limit(10, i64::MIN), 10);
        assert_eq!(select_limit(10, 0), 0);
        assert_eq!(select_limit(10, 3), 3);
        assert_eq!(select_limit(10, 10), 10);
        assert_eq!(select_limit(10, 50), 10);
        assert_eq!(select_limit(0, 5), 0);
    }

    #[test]
    fn test_stored_name_recovers_post_url() {
        let a = reference("https://cdn/1.jpg".into(), "CxYz_12");
        let b = reference("https://cdn/2.jpg".into(), "CxYz_12");
        let name = stored_file_name(&a);
        assert!(name.ends_with("__https:##www.instagram.com#p#CxYz_12#.jpeg"));
        assert_ne!(name, stored_file_name(&b));
        assert_eq!(post_url(&name).as_deref(), Some("https://www.instagram.com/p/CxYz_12/"));
        assert_eq!(post_url("no-separator.jpeg"), None);
        assert_eq!(post_url("abc__https:##x#.png"), None);
    }

    #[tokio::test]
    async fn test_failed_download_is_counted_not_fatal() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/a.jpg")
            .with_status(200)
            .with_body("jpeg-a")
            .create_async()
            .await;
        server
            .mock("GET", "/b.jpg")
            .with_status(200)
            .with_body("jpeg-b")
            .create_async()
            .await;
        server.mock("GET", "/gone.jpg").with_status(404).create_async().await;

        let dir = TempDir::new().unwrap();
        let refs = vec![
            reference(format!("{}/a.jpg", server.url()), "A"),
            reference(format!("{}/gone.jpg", server.url()), "B"),
            reference(format!("{}/b.jpg", server.url()), "C"),
        ];
        let mut progress = Vec::new();
        let report = coordinator(DEFAULT_TIMEOUT)
            .download_all(&refs, dir.path(), -1, |p| progress.push(p))
            .await
            .unwrap();

        assert_eq!(report.downloaded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.directory, dir.path());
        let completed: Vec<_> = progress.iter().map(|p| p.completed).collect();
        assert_eq!(completed, vec![1, 2, 3]);
        assert!(progress.iter().all(|p| p.total == 3));

        let stored = std::fs::read(dir.path().join(stored_file_name(&refs[0]))).unwrap();
        assert_eq!(stored, b"jpeg-a");
        assert!(!dir.path().join(stored_file_name(&refs[1])).exists());
        assert_eq!(report.stored.len(), 2);
        assert!(!report.stored.contains(&dir.path().join(stored_file_name(&refs[1]))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_connection_refused_is_skipped() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = TempDir::new().unwrap();
        let refs = vec![reference(format!("http://{addr}/x.jpg"), "A")];
        let report = coordinator(DEFAULT_TIMEOUT)
            .download_all(&refs, dir.path(), -1, |_| {})
            .await
            .unwrap();
        assert_eq!(report.downloaded, 0);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_stalled_download_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let dir = TempDir::new().unwrap();
        let refs = vec![reference(format!("http://{addr}/slow.jpg"), "A")];
        let report = coordinator(Duration::from_millis(200))
            .download_all(&refs, dir.path(), -1, |_| {})
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Serve `GET /<name>` after the delay configured for that name.
    async fn delayed_server(delays: Vec<(&'static str, Duration)>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let delays = delays.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").trim_start_matches('/');
                    if let Some((_, delay)) = delays.iter().find(|(name, _)| *name == path) {
                        tokio::time::sleep(*delay).await;
                    }
                    let body = path.as_bytes();
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(body).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_downloads_overlap_and_report_in_completion_order() {
        let delays = vec![
            ("slow.jpg", Duration::from_millis(600)),
            ("fast-1.jpg", Duration::from_millis(100)),
            ("fast-2.jpg", Duration::from_millis(100)),
        ];
        let total_delay: Duration = delays.iter().map(|(_, d)| *d).sum();
        let base = delayed_server(delays).await;

        let dir = TempDir::new().unwrap();
        let refs = vec![
            reference(format!("{base}/slow.jpg"), "S"),
            reference(format!("{base}/fast-1.jpg"), "F1"),
            reference(format!("{base}/fast-2.jpg"), "F2"),
        ];
        let mut order = Vec::new();
        let started = std::time::Instant::now();
        let report = coordinator(DEFAULT_TIMEOUT)
            .download_all(&refs, dir.path(), -1, |p| order.push(p.url))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.downloaded, 3);
        assert_eq!(order.len(), 3);
        assert_eq!(order.last(), Some(&refs[0].download_url));
        assert_eq!(report.stored.last(), Some(&dir.path().join(stored_file_name(&refs[0]))));
        assert!(elapsed < total_delay, "took {elapsed:?}, serial would be {total_delay:?}");
    }

    #[tokio::test]
    async fn test_limit_truncates() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Regex(r"^/\d+\.jpg$".into()))
            .with_status(200)
            .with_body("img")
            .expect(2)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let refs: Vec<_> = (0..5)
            .map(|i| reference(format!("{}/{i}.jpg", server.url()), "P"))
            .collect();
        let mut calls = 0;
        let report = coordinator(DEFAULT_TIMEOUT)
            .download_all(&refs, dir.path(), 2, |_| calls += 1)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(report.downloaded, 2);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_creates_nested_directory() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("output").join("someone");
        let report = coordinator(DEFAULT_TIMEOUT)
            .download_all(&[], &dest, -1, |_| {})
            .await
            .unwrap();
        assert!(dest.is_dir());
        assert_eq!(report.downloaded + report.failed, 0);
    }

    #[tokio::test]
    async fn test_uncreatable_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        let result = coordinator(DEFAULT_TIMEOUT)
            .download_all(&[], &file.join("sub"), -1, |_| {})
            .await;
        assert!(matches!(result, Err(DownloadError::CreateDir { .. })));
    }
}
