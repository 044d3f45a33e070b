//! Archive transfer with progress tracking and an overall timeout
//!
//! The whole archive is buffered in memory; it is handed to the interceptor
//! as one buffer. Network errors, non-success statuses and timeouts are all
//! reported as [`TransferError`] and retried only by the caller, from
//! scratch.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::archive::preallocation;

/// How often to invoke the progress callback (in milliseconds)
const CALLBACK_INTERVAL_MS: u128 = 100;

/// Default overall transfer timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Where the archive bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    Remote { url: String },
    Local { path: PathBuf },
}

impl ArchiveSource {
    /// `http(s)://` URLs are remote, anything else is a local path
    pub fn parse(source: &str) -> Self {
        if source.starts_with("http://") || source.starts_with("https://") {
            ArchiveSource::Remote {
                url: source.to_string(),
            }
        } else {
            ArchiveSource::Local {
                path: PathBuf::from(source),
            }
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> String {
        match self {
            ArchiveSource::Remote { url } => truncate_url(url),
            ArchiveSource::Local { path } => path.display().to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP {0}")]
    Status(u16),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Bytes received so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub loaded: u64,
    pub total: Option<u64>,
}

impl TransferProgress {
    /// Fraction in [0, 1], if the total size is known
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.loaded as f64 / total as f64).min(1.0)),
        }
    }

    /// Whole percent, the way the loading hint shows it
    pub fn percent(&self) -> Option<u8> {
        self.fraction().map(|f| (f * 100.0).floor() as u8)
    }
}

/// Progress callback type for UI updates
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// Shared HTTP client for archive transfers
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mmd-previewer/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, timeout })
    }

    /// Fetch the whole archive, reporting progress along the way
    pub async fn fetch(
        &self,
        source: &ArchiveSource,
        progress: Option<&ProgressCallback>,
    ) -> Result<Bytes, TransferError> {
        match source {
            ArchiveSource::Remote { url } => {
                tokio::time::timeout(self.timeout, self.fetch_remote(url, progress))
                    .await
                    .map_err(|_| TransferError::Timeout(self.timeout))?
            }
            ArchiveSource::Local { path } => {
                let data = tokio::fs::read(path).await.map_err(|source| TransferError::Io {
                    path: path.clone(),
                    source,
                })?;
                let len = data.len() as u64;
                if let Some(callback) = progress {
                    callback(TransferProgress {
                        loaded: len,
                        total: Some(len),
                    });
                }
                Ok(Bytes::from(data))
            }
        }
    }

    async fn fetch_remote(
        &self,
        url: &str,
        progress: Option<&ProgressCallback>,
    ) -> Result<Bytes, TransferError> {
        info!("Fetching model archive: {}", truncate_url(url));
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !is_success(status.as_u16()) {
            return Err(TransferError::Status(status.as_u16()));
        }

        let total = response.content_length();
        let mut buffer = BytesMut::with_capacity(preallocation(total.unwrap_or(0)));
        let mut last_callback_time = Instant::now();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);

            if let Some(callback) = progress {
                let now = Instant::now();
                if now.duration_since(last_callback_time).as_millis() >= CALLBACK_INTERVAL_MS {
                    callback(TransferProgress {
                        loaded: buffer.len() as u64,
                        total,
                    });
                    last_callback_time = now;
                }
            }
        }

        let loaded = buffer.len() as u64;
        if let Some(callback) = progress {
            callback(TransferProgress { loaded, total });
        }
        debug!("Fetched {} bytes from {}", loaded, truncate_url(url));

        Ok(buffer.freeze())
    }
}

/// 2xx, or 304 served from a cache
fn is_success(status: u16) -> bool {
    (200..300).contains(&status) || status == 304
}

/// Truncate URL for log messages
fn truncate_url(url: &str) -> String {
    if url.chars().count() > 80 {
        let head: String = url.chars().take(77).collect();
        format!("{}...", head)
    } else {
        url.to_string()
    }
}
