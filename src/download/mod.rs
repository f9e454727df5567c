//! Streaming firmware download with MD5 and SHA-256 computed on the fly.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use md5::Md5;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::events::{CoreEvent, EventSink};

const DEFAULT_FILE_NAME: &str = "firmware.bin";

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Invalid download URL '{0}'")]
    InvalidUrl(String),

    #[error("Server responded with HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Response from {0} has no body")]
    MissingBody(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Failed to write download: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DownloadError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadProgress {
    /// Omitted when the server sent no length
    pub percent: Option<f64>,
    pub bytes_received: u64,
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadRecord {
    pub path: PathBuf,
    pub size: u64,
    pub md5: String,
    pub sha256: String,
    pub file_name: String,
}

pub struct DownloadService {
    client: Client,
    download_dir: PathBuf,
    events: Arc<dyn EventSink>,
}

impl DownloadService {
    pub fn new(download_dir: impl Into<PathBuf>, events: Arc<dyn EventSink>) -> Self {
        Self::with_client(Client::new(), download_dir, events)
    }

    pub fn with_client(client: Client, download_dir: impl Into<PathBuf>, events: Arc<dyn EventSink>) -> Self {
        Self {
            client,
            download_dir: download_dir.into(),
            events,
        }
    }

    /// Fetch `url` into the download directory. A failed download leaves any
    /// partial file in place for the caller.
    pub async fn download(&self, url: &str) -> Result<DownloadRecord> {
        let file_name = file_name_from_url(url)?;
        log::info!("Downloading firmware from: {}", url);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            log::error!("Download request failed with status: {}", response.status());
            return Err(DownloadError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Err(DownloadError::MissingBody(url.to_string()));
        }
        let total = response.content_length();

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let path = self.download_dir.join(&file_name);

        let events = self.events.clone();
        let (size, md5, sha256) = write_stream(response.bytes_stream(), &path, total, move |progress| {
            events.emit(CoreEvent::DownloadProgress(progress));
        })
        .await?;

        log::info!("Firmware download completed: {} ({} bytes)", path.display(), size);
        Ok(DownloadRecord {
            path,
            size,
            md5,
            sha256,
            file_name,
        })
    }
}

/// Last path segment of `url`, reduced to a safe file name
pub fn file_name_from_url(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url).map_err(|_| DownloadError::InvalidUrl(url.to_string()))?;
    let segment = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();

    let cleaned: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    Ok(if cleaned.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    })
}

/// Write every chunk to `path` and both hashers, reporting progress after each.
/// Returns (bytes, md5 hex, sha256 hex).
pub async fn write_stream<S, B, E, F>(
    stream: S,
    path: &Path,
    total: Option<u64>,
    mut on_progress: F,
) -> Result<(u64, String, String)>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    DownloadError: From<E>,
    F: FnMut(DownloadProgress),
{
    let mut stream = std::pin::pin!(stream);
    let mut file = File::create(path).await?;
    let mut md5 = Md5::new();
    let mut sha256 = Sha256::new();
    let mut received = 0u64;
    let total = total.filter(|&t| t > 0);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let bytes = chunk.as_ref();
        file.write_all(bytes).await?;
        md5.update(bytes);
        sha256.update(bytes);
        received += bytes.len() as u64;

        on_progress(DownloadProgress {
            percent: total.map(|t| (received as f64 / t as f64 * 100.0).min(100.0)),
            bytes_received: received,
            total_bytes: total,
        });
    }

    file.flush().await?;
    Ok((received, hex::encode(md5.finalize()), hex::encode(sha256.finalize())))
}
