//! In-memory link between the host and one worker context (a "fork").
//!
//! The host side is a [`ForkHandle`]: it yields a [`HostChannel`] every time
//! the context asks to connect to a shared worker, and resolves its
//! completion once the context has finished. The context side is a
//! [`ForkRuntime`], which opens [`ContextChannel`]s and reports completion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::error::SharedWorkerError;
use crate::protocol::{ChannelMessage, MessageId, MessageIdGenerator};

/// Handshake state of one shared worker channel, as signalled by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Pending,
    Ready,
    Failed,
}

/// Creates both ends of a fork link.
pub fn fork(fork_id: impl Into<String>, file: impl Into<PathBuf>) -> (ForkHandle, ForkRuntime) {
    let fork_id = fork_id.into();
    let file = file.into();
    let (connect_tx, connect_rx) = mpsc::unbounded_channel();
    let (finished_tx, finished_rx) = watch::channel(false);

    let handle = ForkHandle {
        fork_id: fork_id.clone(),
        file: file.clone(),
        connections: connect_rx,
        finished: finished_rx,
    };
    let runtime = ForkRuntime {
        ids: MessageIdGenerator::new(fork_id.as_str()),
        fork_id,
        file,
        connector: Some(connect_tx),
        finished: finished_tx,
    };
    (handle, runtime)
}

/// Like [`fork`], with a freshly generated fork id.
pub fn fork_for(file: impl Into<PathBuf>) -> (ForkHandle, ForkRuntime) {
    fork(Uuid::new_v4().to_string(), file)
}

/// Host-side view of a worker context.
pub struct ForkHandle {
    fork_id: String,
    file: PathBuf,
    connections: mpsc::UnboundedReceiver<HostChannel>,
    finished: watch::Receiver<bool>,
}

impl ForkHandle {
    pub fn fork_id(&self) -> &str {
        &self.fork_id
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Next shared worker connection requested by the context. Returns `None`
    /// once the context can no longer ask.
    pub async fn next_connection(&mut self) -> Option<HostChannel> {
        self.connections.recv().await
    }

    pub fn completion(&self) -> ForkCompletion {
        ForkCompletion {
            finished: self.finished.clone(),
        }
    }
}

/// Resolves when the worker context has finished, successfully or not.
#[derive(Clone)]
pub struct ForkCompletion {
    finished: watch::Receiver<bool>,
}

impl ForkCompletion {
    pub async fn wait(mut self) {
        // The runtime going away without reporting is a failed context.
        let _ = self.finished.wait_for(|finished| *finished).await;
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow() || self.finished.has_changed().is_err()
    }
}

/// Context-side view of the host.
pub struct ForkRuntime {
    fork_id: String,
    file: PathBuf,
    connector: Option<mpsc::UnboundedSender<HostChannel>>,
    finished: watch::Sender<bool>,
    ids: MessageIdGenerator,
}

impl ForkRuntime {
    /// A context running without a host relay. It cannot reach shared
    /// workers.
    pub fn standalone(fork_id: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        let fork_id = fork_id.into();
        let (finished, _) = watch::channel(false);
        Self {
            ids: MessageIdGenerator::new(fork_id.as_str()),
            fork_id,
            file: file.into(),
            connector: None,
            finished,
        }
    }

    pub fn fork_id(&self) -> &str {
        &self.fork_id
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn supports_shared_workers(&self) -> bool {
        self.connector.is_some()
    }

    /// Asks the host to connect this context to the shared worker for
    /// `filename`, launching it with `initial_data` if nobody has yet.
    pub fn connect_shared_worker(
        &self,
        filename: PathBuf,
        initial_data: Value,
    ) -> Result<ContextChannel, SharedWorkerError> {
        let Some(connector) = &self.connector else {
            return Err(SharedWorkerError::Unsupported(
                "this worker context is not connected to a host relay".to_string(),
            ));
        };

        let (to_host, inbound) = mpsc::unbounded_channel();
        let (to_context, from_host) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Pending);

        let host_channel = HostChannel {
            filename: filename.clone(),
            initial_data,
            inbound,
            signals: HostSignals {
                outbound: to_context,
                status: Arc::new(status_tx),
            },
        };
        connector
            .send(host_channel)
            .map_err(|_| SharedWorkerError::Transport("host relay has shut down".to_string()))?;
        debug!(fork_id = %self.fork_id, ?filename, "Requested shared worker connection");

        Ok(ContextChannel {
            poster: ChannelPoster {
                outbound: to_host,
                status: status_rx,
                ids: self.ids.clone(),
            },
            inbound: from_host,
        })
    }

    /// Reports that the context has finished.
    pub fn finish(&self) {
        self.finished.send_replace(true);
    }
}

/// Host end of a shared worker channel.
pub struct HostChannel {
    filename: PathBuf,
    initial_data: Value,
    inbound: mpsc::UnboundedReceiver<ChannelMessage>,
    signals: HostSignals,
}

impl HostChannel {
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn initial_data(&self) -> &Value {
        &self.initial_data
    }

    pub fn signals(&self) -> &HostSignals {
        &self.signals
    }

    /// Splits into the stream of messages from the context and the handle
    /// used to talk back to it.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<ChannelMessage>, HostSignals) {
        (self.inbound, self.signals)
    }
}

/// Lets the host forward messages and handshake outcomes to a context.
#[derive(Clone)]
pub struct HostSignals {
    outbound: mpsc::UnboundedSender<ChannelMessage>,
    status: Arc<watch::Sender<ChannelStatus>>,
}

impl HostSignals {
    pub fn signal_ready(&self) {
        self.status.send_if_modified(|status| {
            if *status == ChannelStatus::Pending {
                *status = ChannelStatus::Ready;
                true
            } else {
                false
            }
        });
    }

    pub fn signal_error(&self) {
        self.status.send_replace(ChannelStatus::Failed);
    }

    /// Returns false when the context is gone.
    pub fn forward_to_fork(&self, message: ChannelMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

/// Context end of a shared worker channel.
pub struct ContextChannel {
    poster: ChannelPoster,
    inbound: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl ContextChannel {
    pub fn poster(&self) -> &ChannelPoster {
        &self.poster
    }

    pub fn into_parts(self) -> (ChannelPoster, mpsc::UnboundedReceiver<ChannelMessage>) {
        (self.poster, self.inbound)
    }
}

/// Sends messages from a context towards its shared worker.
#[derive(Clone)]
pub struct ChannelPoster {
    outbound: mpsc::UnboundedSender<ChannelMessage>,
    status: watch::Receiver<ChannelStatus>,
    ids: MessageIdGenerator,
}

impl ChannelPoster {
    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Waits for the host's handshake outcome.
    pub async fn available(&self) -> Result<(), SharedWorkerError> {
        let mut status = self.status.clone();
        let outcome = status
            .wait_for(|status| *status != ChannelStatus::Pending)
            .await
            .map(|status| *status);
        match outcome {
            Ok(ChannelStatus::Ready) => Ok(()),
            _ => Err(SharedWorkerError::Unavailable),
        }
    }

    /// Assigns a message id and sends `data` to the shared worker.
    pub fn post(
        &self,
        data: Value,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, SharedWorkerError> {
        match self.status() {
            ChannelStatus::Pending => return Err(SharedWorkerError::NotAvailable),
            ChannelStatus::Failed => return Err(SharedWorkerError::Unavailable),
            ChannelStatus::Ready => {}
        }

        let message_id = self.ids.next_id();
        self.outbound
            .send(ChannelMessage {
                message_id: message_id.clone(),
                reply_to,
                data,
            })
            .map_err(|_| SharedWorkerError::Unavailable)?;
        Ok(message_id)
    }
}
