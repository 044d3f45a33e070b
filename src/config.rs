//! Preview configuration
//!
//! Defines the configuration structure for serving a model preview.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::archive::encoding;
use crate::fetch::{ArchiveSource, DEFAULT_TIMEOUT};

/// Default port for the preview origin
pub const DEFAULT_PORT: u16 = 8080;

/// Configuration for a preview session
#[derive(Debug, Clone)]
pub struct PreviewConfig {
    /// Where the model archive comes from
    pub source: ArchiveSource,

    /// Encoding label for entry names not stored as UTF-8
    pub encoding: String,

    /// Address of the preview origin
    pub bind: SocketAddr,

    /// Overall archive transfer timeout
    pub timeout: Duration,

    /// Page assets served for requests the interceptor declines
    pub static_dir: Option<PathBuf>,

    /// Where durable flags are kept
    pub state_dir: PathBuf,
}

impl PreviewConfig {
    pub fn new(source: ArchiveSource, state_dir: PathBuf) -> Self {
        Self {
            source,
            encoding: "utf-8".to_string(),
            bind: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), DEFAULT_PORT),
            timeout: DEFAULT_TIMEOUT,
            static_dir: None,
            state_dir,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let ArchiveSource::Local { path } = &self.source {
            if !path.is_file() {
                return Err(ConfigError::ArchiveNotFound(path.clone()));
            }
        }

        if encoding::resolve_label(&self.encoding).is_err() {
            return Err(ConfigError::UnknownEncoding(self.encoding.clone()));
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        if let Some(dir) = &self.static_dir {
            if !dir.is_dir() {
                return Err(ConfigError::StaticDirNotFound(dir.clone()));
            }
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Model archive not found: {0}")]
    ArchiveNotFound(PathBuf),

    #[error("Unknown encoding label: {0}")]
    UnknownEncoding(String),

    #[error("Transfer timeout must be greater than zero")]
    ZeroTimeout,

    #[error("Static directory not found: {0}")]
    StaticDirNotFound(PathBuf),
}
