use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::message::{Link, MessageStream, PublishedMessage, ReceivedMessage};
use crate::bus::EventBus;
use crate::error::SharedWorkerError;
use crate::fork::{ChannelStatus, ContextChannel};
use crate::protocol::{ChannelMessage, ProtocolIdentifier, CURRENT_PROTOCOL};

/// A worker context's connection to one shared worker.
pub struct SharedWorker {
    filename: PathBuf,
    link: Link,
}

impl SharedWorker {
    pub(crate) fn connect(filename: PathBuf, channel: ContextChannel) -> Self {
        let (poster, inbound) = channel.into_parts();
        let link = Link {
            poster,
            bus: EventBus::new(),
        };
        tokio::spawn(dispatch(inbound, link.clone()));
        Self { filename, link }
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn protocol(&self) -> ProtocolIdentifier {
        CURRENT_PROTOCOL
    }

    /// Resolves once the shared worker can be used, or fails if it never
    /// will be.
    pub async fn available(&self) -> Result<(), SharedWorkerError> {
        self.link.poster.available().await
    }

    pub fn currently_available(&self) -> bool {
        self.link.poster.status() == ChannelStatus::Ready
    }

    /// Sends `data` to the shared worker.
    pub fn publish(&self, data: Value) -> Result<PublishedMessage, SharedWorkerError> {
        self.link.publish(data, None)
    }

    /// Messages from the shared worker that are not replies.
    pub fn subscribe(&self) -> MessageStream {
        self.link.subscribe(None)
    }
}

impl std::fmt::Debug for SharedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWorker")
            .field("filename", &self.filename)
            .field("status", &self.link.poster.status())
            .finish()
    }
}

/// Wraps each inbound message once and fans it out to every stream.
async fn dispatch(mut inbound: mpsc::UnboundedReceiver<ChannelMessage>, link: Link) {
    let mut status = link.poster.status_changes();
    loop {
        tokio::select! {
            biased;
            message = inbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                let received = ReceivedMessage::new(
                    message.message_id,
                    message.data,
                    message.reply_to,
                    link.clone(),
                );
                link.bus.publish(Arc::new(received));
            }
            failed = wait_for_failure(&mut status) => {
                if failed {
                    debug!("Shared worker failed, closing message streams");
                }
                break;
            }
        }
    }
    link.bus.close();
}

/// Returns false if the host went away without reporting a failure.
async fn wait_for_failure(status: &mut watch::Receiver<ChannelStatus>) -> bool {
    status
        .wait_for(|status| *status == ChannelStatus::Failed)
        .await
        .is_ok()
}
