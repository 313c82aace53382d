use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use super::stream::MessageStream;
use super::test_worker::{BroadcastMessage, TestWorker};
use super::WorkerShared;
use crate::error::{SharedWorkerError, HOST_VERSION};
use crate::protocol::{self, ProtocolIdentifier, CURRENT_PROTOCOL};

/// Handed to a plugin factory. The plugin must negotiate a protocol before
/// it can use the shared worker.
pub struct FactoryOptions {
    shared: Arc<WorkerShared>,
    test_workers: TestWorkers,
    outcome: Mutex<Option<oneshot::Sender<bool>>>,
}

impl FactoryOptions {
    pub(crate) fn new(
        shared: Arc<WorkerShared>,
        test_workers: TestWorkers,
        outcome: oneshot::Sender<bool>,
    ) -> Self {
        Self {
            shared,
            test_workers,
            outcome: Mutex::new(Some(outcome)),
        }
    }

    /// Agrees on a protocol with the host.
    ///
    /// Fails when none of `supported` is implemented by this version. That
    /// failure is fatal: the shared worker terminates whatever the plugin
    /// does with the error, and it never becomes available.
    pub fn negotiate_protocol(
        &self,
        supported: &[ProtocolIdentifier],
    ) -> Result<Protocol, SharedWorkerError> {
        let accepted = protocol::is_supported(supported);
        if let Some(outcome) = self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = outcome.send(accepted);
        }

        let filename = &self.shared.data.filename;
        if !accepted {
            error!(?filename, ?supported, "Shared worker plugin requested unsupported protocols");
            return Err(SharedWorkerError::IncompatiblePlugin {
                version: HOST_VERSION,
                filename: filename.clone(),
            });
        }

        info!(shared_worker = %self.shared.data.id, protocol = %CURRENT_PROTOCOL, "Negotiated shared worker protocol");
        Ok(Protocol {
            shared: self.shared.clone(),
            test_workers: self.test_workers.clone(),
        })
    }
}

/// The negotiated protocol, as used by plugin code.
#[derive(Clone)]
pub struct Protocol {
    shared: Arc<WorkerShared>,
    test_workers: TestWorkers,
}

impl Protocol {
    /// Data supplied by whoever first registered this shared worker.
    pub fn initial_data(&self) -> &Value {
        &self.shared.data.initial_data
    }

    pub fn protocol(&self) -> ProtocolIdentifier {
        CURRENT_PROTOCOL
    }

    /// Worker contexts as they register, in arrival order.
    pub fn test_workers(&self) -> TestWorkers {
        self.test_workers.clone()
    }

    /// Sends `data` to every connected worker context.
    pub fn broadcast(&self, data: Value) -> BroadcastMessage {
        self.shared.publish(None, data, None)
    }

    /// Messages from every worker context, excluding replies.
    pub fn subscribe(&self) -> MessageStream {
        self.shared.subscribe(None, None)
    }
}

/// Sequence of newly registered worker contexts.
///
/// Clones share one queue, so each registration is handed out once.
#[derive(Clone)]
pub struct TestWorkers {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TestWorker>>>,
}

impl TestWorkers {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<TestWorker>) -> Self {
        Self {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Waits for the next registration. Returns `None` once the host has
    /// disconnected.
    pub async fn next(&self) -> Option<TestWorker> {
        self.rx.lock().await.recv().await
    }
}
