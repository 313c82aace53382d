use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::spawner::{WorkerEvent, WorkerSpawner};
use crate::bus::{EventBus, Subscription};
use crate::error::SerializedError;
use crate::protocol::{WorkerData, WorkerMessage};
use crate::status::{StateChange, StatusSink};

/// Availability of a shared worker as seen by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceState {
    Pending,
    Available,
    Errored(SerializedError),
}

/// How waiting for a shared worker ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Available,
    Errored(SerializedError),
    /// The worker went away without becoming available or failing.
    Exited,
}

/// One running shared worker, shared by every worker context that uses the
/// same plugin file.
pub struct SharedWorkerInstance {
    id: String,
    filename: PathBuf,
    outbound: Option<mpsc::UnboundedSender<WorkerMessage>>,
    state: watch::Receiver<InstanceState>,
    exited: watch::Receiver<bool>,
    messages: EventBus<WorkerMessage>,
}

impl SharedWorkerInstance {
    fn launch(
        data: WorkerData,
        spawner: &dyn WorkerSpawner,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        let id = data.id.clone();
        let filename = data.filename.clone();
        let (state_tx, state) = watch::channel(InstanceState::Pending);
        let (exited_tx, exited) = watch::channel(false);
        let messages = EventBus::new();

        let outbound = match spawner.spawn(data) {
            Ok(connection) => {
                info!(shared_worker = %id, ?filename, "Launched shared worker");
                tokio::spawn(dispatch_events(
                    id.clone(),
                    connection.events,
                    state_tx,
                    exited_tx,
                    messages.clone(),
                    status,
                ));
                Some(connection.outbound)
            }
            Err(err) => {
                error!(shared_worker = %id, ?filename, "Failed to launch shared worker: {err:#}");
                let err = SerializedError::from_anyhow("SharedWorkerError", &err);
                status.emit_state_change(StateChange::SharedWorkerError { err: err.clone() });
                state_tx.send_replace(InstanceState::Errored(err));
                exited_tx.send_replace(true);
                messages.close();
                None
            }
        };

        Self {
            id,
            filename,
            outbound,
            state,
            exited,
            messages,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn state(&self) -> InstanceState {
        self.state.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Waits until the worker is available, has failed, or has exited.
    pub async fn readiness(&self) -> Readiness {
        let mut state = self.state.clone();
        let mut exited = self.exited.clone();
        tokio::select! {
            biased;
            _ = state.wait_for(|state| *state != InstanceState::Pending) => {}
            _ = exited.wait_for(|exited| *exited) => {}
        }
        match self.state() {
            InstanceState::Available => Readiness::Available,
            InstanceState::Errored(err) => Readiness::Errored(err),
            InstanceState::Pending => Readiness::Exited,
        }
    }

    /// Messages coming out of the worker from now on.
    pub fn subscribe(&self) -> Subscription<WorkerMessage> {
        self.messages.subscribe()
    }

    /// Returns false when the worker can no longer be reached.
    pub fn post(&self, message: WorkerMessage) -> bool {
        match &self.outbound {
            Some(outbound) => outbound.send(message).is_ok(),
            None => false,
        }
    }
}

async fn dispatch_events(
    id: String,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    state: watch::Sender<InstanceState>,
    exited: watch::Sender<bool>,
    messages: EventBus<WorkerMessage>,
    status: Arc<dyn StatusSink>,
) {
    let mut reported = false;
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Message(WorkerMessage::Available) => {
                info!(shared_worker = %id, "Shared worker available");
                state.send_if_modified(|state| {
                    if *state == InstanceState::Pending {
                        *state = InstanceState::Available;
                        true
                    } else {
                        false
                    }
                });
            }
            WorkerEvent::Message(message) => {
                debug!(shared_worker = %id, ?message, "Shared worker message");
                messages.publish(Arc::new(message));
            }
            WorkerEvent::Error(err) => {
                if reported {
                    warn!(shared_worker = %id, %err, "Ignoring further shared worker error");
                    continue;
                }
                reported = true;
                error!(shared_worker = %id, %err, "Shared worker failed");
                status.emit_state_change(StateChange::SharedWorkerError { err: err.clone() });
                state.send_replace(InstanceState::Errored(err));
            }
            WorkerEvent::Exit { code } => {
                info!(shared_worker = %id, ?code, "Shared worker exited");
                break;
            }
        }
    }

    exited.send_replace(true);
    messages.close();
}

/// Launches at most one shared worker per plugin file.
pub struct SharedWorkerLauncher {
    spawner: Arc<dyn WorkerSpawner>,
    status: Arc<dyn StatusSink>,
    inner: Mutex<LauncherInner>,
}

#[derive(Default)]
struct LauncherInner {
    launched: u64,
    instances: HashMap<PathBuf, Arc<SharedWorkerInstance>>,
}

impl SharedWorkerLauncher {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, status: Arc<dyn StatusSink>) -> Self {
        Self {
            spawner,
            status,
            inner: Mutex::new(LauncherInner::default()),
        }
    }

    /// Returns the instance for `filename`, launching it with `initial_data`
    /// if this is the first request. Later requests get the same instance
    /// whatever data they carry.
    pub fn launch(&self, filename: &Path, initial_data: &Value) -> Arc<SharedWorkerInstance> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(instance) = inner.instances.get(filename) {
            return instance.clone();
        }

        inner.launched += 1;
        let data = WorkerData {
            filename: filename.to_path_buf(),
            id: format!("shared-worker/{}", inner.launched),
            initial_data: initial_data.clone(),
        };
        let instance = Arc::new(SharedWorkerInstance::launch(
            data,
            self.spawner.as_ref(),
            self.status.clone(),
        ));
        inner
            .instances
            .insert(filename.to_path_buf(), instance.clone());
        instance
    }

    pub fn get(&self, filename: &Path) -> Option<Arc<SharedWorkerInstance>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .instances
            .get(filename)
            .cloned()
    }

    /// Number of shared workers launched so far.
    pub fn launched(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .launched
    }
}
