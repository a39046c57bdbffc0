//! File transfer backends
//!
//! A backend fetches one locator to one destination path. It does not clean
//! up after itself on failure; the caller owns the destination and removes any
//! partial file.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::harvest::config_loader::{AppConfig, DownloadBackend};

/// Error types for file transfers
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Transfer command failed: {0}")]
    Command(String),

    #[error("Download error: {0}")]
    Download(String),
}

/// Result type for download operations
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Retrieves a locator into a local file
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Returns the number of bytes written on success.
    async fn fetch_to_file(&self, url: &str, dest: &Path) -> DownloadResult<u64>;
}

/// Streams response bodies straight to disk
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new(user_agent: &str, timeout: Duration) -> DownloadResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self { client })
    }

    /// Stream a response to a file
    async fn stream_to_file(response: Response, file_path: &Path) -> DownloadResult<u64> {
        let mut file = File::create(file_path).await?;
        let mut stream = response.bytes_stream();
        let mut bytes_downloaded = 0u64;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result
                .map_err(|e| DownloadError::Download(format!("Failed to get chunk: {}", e)))?;
            file.write_all(&chunk).await?;
            bytes_downloaded += chunk.len() as u64;
        }

        // Ensure all data is written to disk
        file.flush().await?;

        Ok(bytes_downloaded)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    #[instrument(skip(self), fields(dest = %dest.display()))]
    async fn fetch_to_file(&self, url: &str, dest: &Path) -> DownloadResult<u64> {
        let response = self.client.get(url).send().await?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("Rate limit exceeded while downloading {}", url);
                return Err(DownloadError::RateLimitExceeded);
            }
            status if !status.is_success() => {
                return Err(DownloadError::InvalidResponse(format!("HTTP error: {}", status)));
            }
            _ => {}
        }

        let bytes = Self::stream_to_file(response, dest).await?;
        if bytes == 0 {
            return Err(DownloadError::InvalidResponse("empty response body".to_string()));
        }

        debug!("Downloaded {} bytes from {}", bytes, url);
        Ok(bytes)
    }
}

/// Shells out to curl for each transfer
pub struct CurlDownloader {
    program: PathBuf,
    timeout: Duration,
}

impl CurlDownloader {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Downloader for CurlDownloader {
    #[instrument(skip(self), fields(dest = %dest.display()))]
    async fn fetch_to_file(&self, url: &str, dest: &Path) -> DownloadResult<u64> {
        let output = Command::new(&self.program)
            .arg("--fail")
            .arg("--silent")
            .arg("--show-error")
            .arg("--location")
            .arg("--max-time")
            .arg(self.timeout.as_secs().max(1).to_string())
            .arg("--output")
            .arg(dest)
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DownloadError::Command(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        let bytes = tokio::fs::metadata(dest).await?.len();
        if bytes == 0 {
            return Err(DownloadError::InvalidResponse("empty response body".to_string()));
        }

        Ok(bytes)
    }
}

/// Build the backend selected in the config
pub fn init_downloader(config: &AppConfig) -> DownloadResult<Arc<dyn Downloader>> {
    let timeout = Duration::from_secs(config.download.timeout_secs);
    Ok(match config.download.backend {
        DownloadBackend::Http => Arc::new(HttpDownloader::new(&config.search.user_agent, timeout)?),
        DownloadBackend::Curl => Arc::new(CurlDownloader::new(&config.download.curl_path, timeout)),
    })
}
