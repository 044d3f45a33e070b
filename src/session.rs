//! The requesting side of a preview
//!
//! A session runs the readiness handshake, opens the relay channel, and then
//! loads archives: fetch bytes, hand them to the interceptor, and wait for the
//! relay to say whether the model can be loaded.

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::fetch::{ArchiveSource, Fetcher, ProgressCallback, TransferError};
use crate::interceptor::Interceptor;
use crate::lifecycle::{self, Activation, LifecycleError, Registry};
use crate::paths;
use crate::protocol::{relay_channel, ChannelMessage, RelayReceiver, WorkerMessage};
use crate::storage::ReadinessStore;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Model preview is not supported in this environment")]
    UnsupportedEnvironment,

    #[error("Failed to load the model archive: {0}")]
    Transfer(#[from] TransferError),

    #[error("Invalid model archive")]
    InvalidArchiveFormat,

    #[error("Interception process stopped unexpectedly")]
    InterceptorGone,

    #[error(transparent)]
    Lifecycle(LifecycleError),
}

impl From<LifecycleError> for SessionError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::UnsupportedEnvironment => SessionError::UnsupportedEnvironment,
            other => SessionError::Lifecycle(other),
        }
    }
}

impl SessionError {
    /// Only transfer failures are worth a manual retry; the same bytes
    /// will not parse differently
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Transfer(_))
    }
}

/// The archive is indexed and its model can be requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReady {
    /// Descriptor path as stored in the archive
    pub descriptor_path: String,
    /// Request path the model loader should use
    pub url: String,
}

impl ModelReady {
    fn new(descriptor_path: String) -> Self {
        let url = paths::virtual_url(&descriptor_path);
        Self {
            descriptor_path,
            url,
        }
    }
}

/// One requester session, bound to an active interceptor
pub struct Session {
    id: Uuid,
    interceptor: Interceptor,
    relay: RelayReceiver,
    /// `zipReady` posts whose relay reply has not been taken yet
    pending: usize,
    reloads: u32,
}

impl Session {
    /// Handshake and open the relay channel.
    ///
    /// On the first activation for this origin the session is reloaded once
    /// before it is returned.
    pub async fn connect(registry: &Registry, store: &ReadinessStore) -> Result<Self, SessionError> {
        let mut reloads = 0;
        let (id, interceptor) = loop {
            let id = Uuid::new_v4();
            let activation = lifecycle::activate(registry, store)
                .instrument(info_span!("session", %id))
                .await?;
            match activation {
                Activation::Active(interceptor) => break (id, interceptor),
                Activation::ReloadRequired if reloads == 0 => {
                    reloads += 1;
                    info!("Reloading session {}", id);
                }
                Activation::ReloadRequired => {
                    return Err(LifecycleError::ReloadLoop.into());
                }
            }
        };

        let (port, relay) = relay_channel();
        interceptor
            .post_message(WorkerMessage::InitMessageChannel {
                message_channel_port: port,
            })
            .map_err(|_| SessionError::InterceptorGone)?;

        debug!("Session {} connected after {} reload(s)", id, reloads);
        Ok(Self {
            id,
            interceptor,
            relay,
            pending: 0,
            reloads,
        })
    }

    /// Forced reloads performed while connecting
    pub fn reloads(&self) -> u32 {
        self.reloads
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    /// Full ingestion path: fetch, submit, wait for the relay verdict.
    ///
    /// Retrying after a transfer failure means calling this again.
    pub async fn load(
        &mut self,
        fetcher: &Fetcher,
        source: &ArchiveSource,
        encoding: &str,
        progress: Option<&ProgressCallback>,
    ) -> Result<ModelReady, SessionError> {
        let span = info_span!("session", id = %self.id);
        async {
            let bytes = match fetcher.fetch(source, progress).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Archive transfer failed for {}: {}", source.description(), e);
                    return Err(e.into());
                }
            };
            self.submit(bytes, encoding).await
        }
        .instrument(span)
        .await
    }

    /// Hand archive bytes to the interceptor and wait for its verdict.
    ///
    /// The relay answers every `zipReady` in order. Replies owed to earlier
    /// submits that were dropped before completing are skipped.
    pub async fn submit(&mut self, file: Bytes, encoding: &str) -> Result<ModelReady, SessionError> {
        info!("Submitting {} byte archive ({})", file.len(), encoding);
        self.interceptor
            .post_message(WorkerMessage::ZipReady {
                file,
                encoding: encoding.to_string(),
            })
            .map_err(|_| SessionError::InterceptorGone)?;
        self.pending += 1;

        while self.pending > 1 {
            let stale = self.relay.recv().await.ok_or(SessionError::InterceptorGone)?;
            self.pending -= 1;
            debug!("Skipping {} reply to an abandoned submit", stale.kind());
        }

        let reply = self.relay.recv().await;
        self.pending -= 1;
        match reply {
            Some(ChannelMessage::MmdDataReady { pmx_file_name }) => {
                let ready = ModelReady::new(pmx_file_name);
                info!("Model ready at {}", ready.url);
                Ok(ready)
            }
            Some(ChannelMessage::InvalidMmdZipFormat {}) => Err(SessionError::InvalidArchiveFormat),
            None => Err(SessionError::InterceptorGone),
        }
    }
}
