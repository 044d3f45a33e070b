//! The interception process
//!
//! A long-lived actor task owns the coordination state (relay port + current
//! archive index) and processes [`WorkerMessage`]s one at a time, in order.
//! Request resolution runs on any number of cloned [`Interceptor`] handles
//! concurrently: each request reads the latest published index snapshot and
//! never waits on the actor or on other requests.

pub mod server;

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveError, ArchiveIndex};
use crate::paths;
use crate::protocol::{ChannelMessage, RelayPort, WorkerMessage};

/// Published index snapshot; None means "not ready, decline everything"
type IndexSnapshot = Option<Arc<ArchiveIndex>>;

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("Interception process has stopped")]
    Stopped,
}

/// One intercepted outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualRequest {
    pub raw_url: String,
    pub declared_folder_tag: String,
    pub raw_resource_path: String,
}

impl VirtualRequest {
    /// Split a request path into its first segment and the rest.
    ///
    /// `/tag/some/file.png` -> (`tag`, `some/file.png`). Returns None when
    /// there is no separator after the first segment or either side is empty.
    pub fn parse(raw_url: &str) -> Option<Self> {
        let path = raw_url.strip_prefix('/').unwrap_or(raw_url);
        let (tag, rest) = path.split_once('/')?;
        if tag.is_empty() || rest.is_empty() {
            return None;
        }
        Some(Self {
            raw_url: raw_url.to_string(),
            declared_folder_tag: tag.to_string(),
            raw_resource_path: rest.to_string(),
        })
    }

    /// Whether the request addresses the reserved virtual folder
    pub fn is_virtual(&self) -> bool {
        self.declared_folder_tag == paths::VIRTUAL_FOLDER_MARKER
    }
}

/// Why a request was left to the normal network path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    NoArchive,
    Unparseable,
    ForeignFolder,
    NotInArchive,
}

/// Outcome of observing one request
#[derive(Debug)]
pub enum Resolution {
    /// Answer with these bytes
    Intercepted(Bytes),
    /// Let the request proceed untouched
    Declined(DeclineReason),
    /// The entry exists but could not be decompressed
    Error(ArchiveError),
}

/// Process-wide state, touched only by the actor task
struct CoordinationState {
    relay_port: Option<RelayPort>,
    index_tx: watch::Sender<IndexSnapshot>,
}

impl CoordinationState {
    async fn handle(&mut self, message: WorkerMessage) {
        debug!("Interceptor received {}", message.kind());
        match message {
            WorkerMessage::InitMessageChannel {
                message_channel_port,
            } => {
                if self.relay_port.is_some() {
                    debug!("Replacing relay port");
                }
                self.relay_port = Some(message_channel_port);
            }
            WorkerMessage::ZipReady { file, encoding } => {
                let reply = self.load_archive(file, &encoding).await;
                self.post(reply);
            }
        }
    }

    /// Build, find the descriptor, and publish the new index on success.
    ///
    /// A failed load leaves the previous index in place.
    async fn load_archive(&mut self, file: Bytes, encoding: &str) -> ChannelMessage {
        let index = match ArchiveIndex::build(file, encoding).await {
            Ok(index) => index,
            Err(e) => {
                warn!("Rejected model archive: {}", e);
                return ChannelMessage::InvalidMmdZipFormat {};
            }
        };

        let pmx_file_name = match index.find_descriptor() {
            Some(entry) => entry.stored_path().to_string(),
            None => {
                warn!("Rejected model archive: {}", ArchiveError::DescriptorNotFound);
                return ChannelMessage::InvalidMmdZipFormat {};
            }
        };

        info!(
            "Serving {} archive entries, model {}",
            index.len(),
            pmx_file_name
        );
        self.index_tx.send_replace(Some(Arc::new(index)));
        ChannelMessage::MmdDataReady { pmx_file_name }
    }

    fn post(&self, message: ChannelMessage) {
        match &self.relay_port {
            Some(port) => {
                port.post(message);
            }
            None => warn!(
                "No relay port initialized, dropping {} message",
                message.kind()
            ),
        }
    }
}

async fn run(mut mailbox: mpsc::UnboundedReceiver<WorkerMessage>, mut state: CoordinationState) {
    while let Some(message) = mailbox.recv().await {
        state.handle(message).await;
    }
    debug!("Interceptor mailbox closed");
}

/// Handle to the interception process
#[derive(Debug, Clone)]
pub struct Interceptor {
    mailbox: mpsc::UnboundedSender<WorkerMessage>,
    index: watch::Receiver<IndexSnapshot>,
}

impl Interceptor {
    /// Start the actor task. It runs until every handle is dropped.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (index_tx, index_rx) = watch::channel(None);

        let state = CoordinationState {
            relay_port: None,
            index_tx,
        };
        let task = tokio::spawn(run(mailbox_rx, state));

        (
            Self {
                mailbox: mailbox_tx,
                index: index_rx,
            },
            task,
        )
    }

    /// Queue a message; handled after everything posted before it
    pub fn post_message(&self, message: WorkerMessage) -> Result<(), InterceptError> {
        self.mailbox
            .send(message)
            .map_err(|_| InterceptError::Stopped)
    }

    /// Whether an archive index is currently published
    pub fn is_ready(&self) -> bool {
        self.index.borrow().is_some()
    }

    fn snapshot(&self) -> IndexSnapshot {
        self.index.borrow().clone()
    }

    /// Decide whether to answer a request path from the archive
    pub async fn resolve(&self, raw_url: &str) -> Resolution {
        let Some(index) = self.snapshot() else {
            return Resolution::Declined(DeclineReason::NoArchive);
        };

        let Some(request) = VirtualRequest::parse(raw_url) else {
            return Resolution::Declined(DeclineReason::Unparseable);
        };
        if !request.is_virtual() {
            return Resolution::Declined(DeclineReason::ForeignFolder);
        }

        let key = paths::normalize(&request.raw_resource_path);
        let Some(entry) = index.resolve(&key) else {
            debug!("Not in archive: {}", key);
            return Resolution::Declined(DeclineReason::NotInArchive);
        };

        match entry.read().await {
            Ok(bytes) => {
                debug!("Intercepted {} ({} bytes)", entry.stored_path(), bytes.len());
                Resolution::Intercepted(bytes)
            }
            Err(e) => {
                warn!("Failed to decompress {}: {}", entry.stored_path(), e);
                Resolution::Error(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::zip_bytes;
    use crate::paths::{virtual_url, VIRTUAL_FOLDER_MARKER};
    use crate::protocol::{relay_channel, RelayReceiver};

    fn model_zip() -> Bytes {
        zip_bytes(&[
            ("model.pmx", b"PMX 2.0 descriptor"),
            ("tex/Body.png", b"body texture"),
            ("tex/face.png", b"face texture"),
        ])
    }

    async fn loaded() -> (Interceptor, RelayReceiver) {
        let (interceptor, _task) = Interceptor::spawn();
        let (port, mut relay) = relay_channel();
        interceptor
            .post_message(WorkerMessage::InitMessageChannel {
                message_channel_port: port,
            })
            .unwrap();
        interceptor
            .post_message(WorkerMessage::ZipReady {
                file: model_zip(),
                encoding: "utf-8".into(),
            })
            .unwrap();
        assert_eq!(
            relay.recv().await.unwrap(),
            ChannelMessage::MmdDataReady {
                pmx_file_name: "model.pmx".into()
            }
        );
        (interceptor, relay)
    }

    fn assert_declined(resolution: Resolution, reason: DeclineReason) {
        match resolution {
            Resolution::Declined(r) => assert_eq!(r, reason),
            other => panic!("expected decline ({:?}), got {:?}", reason, other),
        }
    }

    #[test]
    fn test_parse_request() {
        let req = VirtualRequest::parse("/marker/tex/a%20b.png").unwrap();
        assert_eq!(req.declared_folder_tag, "marker");
        assert_eq!(req.raw_resource_path, "tex/a%20b.png");
        assert_eq!(req.raw_url, "/marker/tex/a%20b.png");
        assert!(!req.is_virtual());

        assert!(VirtualRequest::parse("/index.html").is_none());
        assert!(VirtualRequest::parse("/marker/").is_none());
        assert!(VirtualRequest::parse("//x").is_none());
        assert!(VirtualRequest::parse(&format!("/{}/m.pmx", VIRTUAL_FOLDER_MARKER))
            .unwrap()
            .is_virtual());
    }

    #[tokio::test]
    async fn test_declines_before_load() {
        let (interceptor, _task) = Interceptor::spawn();
        assert!(!interceptor.is_ready());
        assert_declined(
            interceptor.resolve(&virtual_url("model.pmx")).await,
            DeclineReason::NoArchive,
        );
        assert_declined(
            interceptor.resolve("/other/model.pmx").await,
            DeclineReason::NoArchive,
        );
    }

    #[tokio::test]
    async fn test_serves_descriptor_bytes() {
        let (interceptor, _relay) = loaded().await;
        assert!(interceptor.is_ready());
        match interceptor.resolve(&virtual_url("model.pmx")).await {
            Resolution::Intercepted(bytes) => assert_eq!(&bytes[..], b"PMX 2.0 descriptor"),
            other => panic!("expected interception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_case_and_encoding_insensitive() {
        let (interceptor, _relay) = loaded().await;
        let url = format!("/{}/TEX/body%2Epng", VIRTUAL_FOLDER_MARKER);
        match interceptor.resolve(&url).await {
            Resolution::Intercepted(bytes) => assert_eq!(&bytes[..], b"body texture"),
            other => panic!("expected interception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_foreign_folder_declined() {
        let (interceptor, _relay) = loaded().await;
        assert_declined(
            interceptor.resolve("/other/model.pmx").await,
            DeclineReason::ForeignFolder,
        );
        assert_declined(
            interceptor.resolve("/favicon.ico").await,
            DeclineReason::Unparseable,
        );
    }

    #[tokio::test]
    async fn test_missing_entry_declined() {
        let (interceptor, _relay) = loaded().await;
        assert_declined(
            interceptor.resolve(&virtual_url("missing.png")).await,
            DeclineReason::NotInArchive,
        );
    }

    #[tokio::test]
    async fn test_corrupt_archive_reports_once() {
        let (interceptor, _task) = Interceptor::spawn();
        let (port, mut relay) = relay_channel();
        interceptor
            .post_message(WorkerMessage::InitMessageChannel {
                message_channel_port: port,
            })
            .unwrap();
        interceptor
            .post_message(WorkerMessage::ZipReady {
                file: Bytes::from_static(b"PK\x03\x04 truncated garbage"),
                encoding: "utf-8".into(),
            })
            .unwrap();

        assert_eq!(
            relay.recv().await.unwrap(),
            ChannelMessage::InvalidMmdZipFormat {}
        );
        // Dropping every handle stops the actor, which closes the relay
        drop(interceptor);
        assert!(relay.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_archive_without_descriptor() {
        let (interceptor, _task) = Interceptor::spawn();
        let (port, mut relay) = relay_channel();
        interceptor
            .post_message(WorkerMessage::InitMessageChannel {
                message_channel_port: port,
            })
            .unwrap();
        interceptor
            .post_message(WorkerMessage::ZipReady {
                file: zip_bytes(&[("tex/a.png", b"a")]),
                encoding: "utf-8".into(),
            })
            .unwrap();
        assert_eq!(
            relay.recv().await.unwrap(),
            ChannelMessage::InvalidMmdZipFormat {}
        );
        assert!(!interceptor.is_ready());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_archive() {
        let (interceptor, mut relay) = loaded().await;
        interceptor
            .post_message(WorkerMessage::ZipReady {
                file: Bytes::from_static(b"garbage"),
                encoding: "utf-8".into(),
            })
            .unwrap();
        assert_eq!(
            relay.recv().await.unwrap(),
            ChannelMessage::InvalidMmdZipFormat {}
        );
        assert!(matches!(
            interceptor.resolve(&virtual_url("model.pmx")).await,
            Resolution::Intercepted(_)
        ));
    }

    #[tokio::test]
    async fn test_new_archive_replaces_index() {
        let (interceptor, mut relay) = loaded().await;
        interceptor
            .post_message(WorkerMessage::ZipReady {
                file: zip_bytes(&[("other/Alt.pmx", b"alt")]),
                encoding: "utf-8".into(),
            })
            .unwrap();
        assert_eq!(
            relay.recv().await.unwrap(),
            ChannelMessage::MmdDataReady {
                pmx_file_name: "other/Alt.pmx".into()
            }
        );
        assert_declined(
            interceptor.resolve(&virtual_url("model.pmx")).await,
            DeclineReason::NotInArchive,
        );
        assert!(matches!(
            interceptor.resolve(&virtual_url("other/alt.pmx")).await,
            Resolution::Intercepted(_)
        ));
    }

    #[tokio::test]
    async fn test_relay_port_replaced() {
        let (interceptor, mut first) = loaded().await;
        let (port, mut second) = relay_channel();
        interceptor
            .post_message(WorkerMessage::InitMessageChannel {
                message_channel_port: port,
            })
            .unwrap();
        interceptor
            .post_message(WorkerMessage::ZipReady {
                file: model_zip(),
                encoding: "utf-8".into(),
            })
            .unwrap();
        assert_eq!(second.recv().await.unwrap().kind(), "mmdDataReady");
        // The old port was dropped when replaced
        assert!(first.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_zip_ready_without_relay_still_loads() {
        let (interceptor, _task) = Interceptor::spawn();
        interceptor
            .post_message(WorkerMessage::ZipReady {
                file: model_zip(),
                encoding: "utf-8".into(),
            })
            .unwrap();
        let (port, mut relay) = relay_channel();
        interceptor
            .post_message(WorkerMessage::InitMessageChannel {
                message_channel_port: port,
            })
            .unwrap();
        interceptor
            .post_message(WorkerMessage::ZipReady {
                file: Bytes::from_static(b"bad"),
                encoding: String::new(),
            })
            .unwrap();

        // Mailbox order: the first load finished before this reply was sent
        assert_eq!(
            relay.recv().await.unwrap(),
            ChannelMessage::InvalidMmdZipFormat {}
        );
        assert!(interceptor.is_ready());
    }

    #[tokio::test]
    async fn test_concurrent_resolution() {
        let (interceptor, _relay) = loaded().await;
        let body = virtual_url("tex/Body.png");
        let face = virtual_url("tex/face.png");
        let (a, b, c) = tokio::join!(
            interceptor.resolve(&body),
            interceptor.resolve(&face),
            interceptor.resolve("/other/x")
        );
        assert!(matches!(a, Resolution::Intercepted(ref x) if &x[..] == b"body texture"));
        assert!(matches!(b, Resolution::Intercepted(ref x) if &x[..] == b"face texture"));
        assert!(matches!(c, Resolution::Declined(DeclineReason::ForeignFolder)));
    }
}
