//! Messages exchanged between the requester and the interception process.
//!
//! Two one-way channels, each FIFO:
//! - requester -> interceptor: [`WorkerMessage`], carried by the actor mailbox
//! - interceptor -> relay port: [`ChannelMessage`], the only way back
//!
//! Payloads are moved into the message, so the archive buffer and the relay
//! port belong to the receiver once sent. Relay messages keep the
//! `{ "type": ..., "data": ... }` wire shape so they can be forwarded to a
//! browser client unchanged.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Requester -> interceptor
#[derive(Debug)]
pub enum WorkerMessage {
    /// Hand over the sending half of the relay channel
    InitMessageChannel { message_channel_port: RelayPort },

    /// Archive bytes are available; index them and report back on the relay
    ZipReady { file: Bytes, encoding: String },
}

impl WorkerMessage {
    /// Wire discriminator
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::InitMessageChannel { .. } => "initMessageChannel",
            WorkerMessage::ZipReady { .. } => "zipReady",
        }
    }
}

/// Interceptor -> requester, over the relay port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ChannelMessage {
    /// The archive is indexed; load the model from this descriptor path
    #[serde(rename_all = "camelCase")]
    MmdDataReady { pmx_file_name: String },

    /// The archive could not be used as a model archive
    InvalidMmdZipFormat {},
}

impl ChannelMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMessage::MmdDataReady { .. } => "mmdDataReady",
            ChannelMessage::InvalidMmdZipFormat {} => "invalidMmdZipFormat",
        }
    }
}

/// Sending half of the relay channel, owned by the interceptor
#[derive(Debug)]
pub struct RelayPort {
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

impl RelayPort {
    /// Post a message to the requester.
    ///
    /// Returns false when the requester side is gone; the interceptor keeps
    /// running either way.
    pub fn post(&self, message: ChannelMessage) -> bool {
        let kind = message.kind();
        match self.tx.send(message) {
            Ok(()) => {
                debug!("Relay sent {}", kind);
                true
            }
            Err(_) => {
                debug!("Relay closed, dropped {}", kind);
                false
            }
        }
    }
}

/// Receiving half of the relay channel, kept by the requester
#[derive(Debug)]
pub struct RelayReceiver {
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl RelayReceiver {
    /// Next relay message, or None once the interceptor dropped the port
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }
}

/// Create a relay channel pair
pub fn relay_channel() -> (RelayPort, RelayReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RelayPort { tx }, RelayReceiver { rx })
}
