//! Shared worker entry.
//!
//! Runs inside the long-lived shared worker on a single-threaded loop. It
//! loads the plugin factory, lets the plugin negotiate a protocol, tracks the
//! worker contexts the host registers, and routes their messages to plugin
//! code.
//!
//! Every message arriving from a worker context is wrapped once and fanned
//! out to one queue per [`MessageStream`], so independent streams each see
//! it exactly once and all of them hold the same `Arc<ReceivedMessage>`.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::error::{SharedWorkerError, HOST_VERSION};
use crate::loader::PluginLoader;
use crate::protocol::{MessageId, MessageIdGenerator, WorkerData, WorkerMessage};

mod negotiate;
mod registry;
mod stream;
mod test_worker;

pub use negotiate::{FactoryOptions, Protocol, TestWorkers};
pub use registry::Release;
pub use stream::MessageStream;
pub use test_worker::{BroadcastMessage, PublishedMessage, ReceivedMessage, TestWorker};

use registry::TestWorkerRegistry;

#[cfg(test)]
mod tests;

/// The shared worker's side of its link with the host.
pub struct WorkerTransport {
    /// Messages for the host.
    pub outbound: mpsc::UnboundedSender<WorkerMessage>,
    /// Messages from the host.
    pub inbound: mpsc::UnboundedReceiver<WorkerMessage>,
}

/// State shared by everything plugin code can reach.
pub(crate) struct WorkerShared {
    pub(crate) data: WorkerData,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    ids: MessageIdGenerator,
    bus: EventBus<ReceivedMessage>,
    pub(crate) registry: TestWorkerRegistry,
}

impl WorkerShared {
    fn new(data: WorkerData, outbound: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        let ids = MessageIdGenerator::new(data.id.as_str());
        Self {
            data,
            outbound,
            ids,
            bus: EventBus::new(),
            registry: TestWorkerRegistry::default(),
        }
    }

    fn post(&self, message: WorkerMessage) {
        if self.outbound.send(message).is_err() {
            warn!(shared_worker = %self.data.id, "Host disconnected, dropping outbound message");
        }
    }

    pub(crate) fn publish(
        self: &Arc<Self>,
        target: Option<TestWorker>,
        data: Value,
        reply_to: Option<MessageId>,
    ) -> PublishedMessage {
        let id = self.ids.next_id();
        let message = match &target {
            Some(worker) => WorkerMessage::Message {
                message_id: id.clone(),
                test_worker_id: worker.id().to_string(),
                data,
                reply_to,
            },
            None => WorkerMessage::Broadcast {
                message_id: id.clone(),
                data,
                reply_to,
            },
        };
        debug!(message_id = %id, target = ?target.as_ref().map(TestWorker::id), "Publishing message");
        self.post(message);

        PublishedMessage {
            id,
            target,
            shared: self.clone(),
        }
    }

    pub(crate) fn subscribe(
        self: &Arc<Self>,
        test_worker: Option<TestWorker>,
        reply_to: Option<MessageId>,
    ) -> MessageStream {
        MessageStream::new(
            self.bus.subscribe(),
            test_worker,
            reply_to,
            self.registry.clone(),
        )
    }
}

/// Runs a shared worker until the host disconnects.
///
/// Fails without ever announcing availability when the plugin cannot be
/// loaded or rejects negotiation, and fails later if plugin code errors. The
/// caller must treat any error as fatal for the shared worker.
pub async fn run_shared_worker(
    data: WorkerData,
    transport: WorkerTransport,
    loader: &dyn PluginLoader,
) -> Result<(), SharedWorkerError> {
    let WorkerTransport { outbound, inbound } = transport;
    let filename = data.filename.clone();
    info!(shared_worker = %data.id, ?filename, "Starting shared worker");

    let factory = loader
        .load(&filename)
        .await
        .map_err(|reason| SharedWorkerError::Load {
            filename: filename.clone(),
            reason,
        })?;

    let shared = Arc::new(WorkerShared::new(data, outbound));
    let (registered_tx, registered_rx) = mpsc::unbounded_channel();
    let (outcome_tx, mut outcome_rx) = oneshot::channel();
    let options = FactoryOptions::new(shared.clone(), TestWorkers::new(registered_rx), outcome_tx);

    let mut plugin = factory.create(options);
    let mut plugin_done = false;

    let accepted = tokio::select! {
        biased;
        outcome = &mut outcome_rx => outcome.ok(),
        result = &mut plugin => {
            plugin_done = true;
            match outcome_rx.try_recv() {
                Ok(accepted) => Some(accepted),
                Err(_) => {
                    result.map_err(SharedWorkerError::Plugin)?;
                    None
                }
            }
        }
    };

    match accepted {
        Some(true) => {}
        Some(false) => {
            return Err(SharedWorkerError::IncompatiblePlugin {
                version: HOST_VERSION,
                filename,
            })
        }
        None => return Err(SharedWorkerError::NotNegotiated(filename)),
    }

    shared.post(WorkerMessage::Available);
    info!(shared_worker = %shared.data.id, "Shared worker available");

    let control = receive_messages(shared.clone(), inbound, registered_tx);
    tokio::pin!(control);

    loop {
        tokio::select! {
            result = &mut plugin, if !plugin_done => {
                plugin_done = true;
                result.map_err(SharedWorkerError::Plugin)?;
                debug!(shared_worker = %shared.data.id, "Plugin factory returned");
            }
            () = &mut control => break,
        }
    }

    info!(shared_worker = %shared.data.id, "Shared worker stopped");
    Ok(())
}

/// Applies control messages from the host and fans out inbound messages.
async fn receive_messages(
    shared: Arc<WorkerShared>,
    mut inbound: mpsc::UnboundedReceiver<WorkerMessage>,
    registered: mpsc::UnboundedSender<TestWorker>,
) {
    while let Some(message) = inbound.recv().await {
        match message {
            WorkerMessage::RegisterTestWorker { id, file } => {
                let state = shared.registry.register(id, file);
                let worker = TestWorker::new(state, shared.clone());
                if registered.send(worker).is_err() {
                    debug!("Nobody is listening for test worker registrations");
                }
            }
            WorkerMessage::DeregisterTestWorker { id } => {
                shared.registry.deregister(&id);
            }
            WorkerMessage::Message {
                message_id,
                test_worker_id,
                data,
                reply_to,
            } => {
                let Some(state) = shared.registry.get(&test_worker_id) else {
                    warn!(%message_id, test_worker = %test_worker_id, "Dropping message from unregistered test worker");
                    continue;
                };
                let received = ReceivedMessage {
                    id: message_id,
                    data,
                    reply_to,
                    test_worker: TestWorker::new(state, shared.clone()),
                };
                shared.bus.publish(Arc::new(received));
            }
            other => warn!(message = ?other, "Ignoring unexpected message from host"),
        }
    }

    info!(shared_worker = %shared.data.id, "Host disconnected");
    shared.bus.close();
    shared.registry.deregister_all();
}

