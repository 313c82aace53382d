use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::instance::{InstanceState, Readiness, SharedWorkerInstance, SharedWorkerLauncher};
use super::spawner::WorkerSpawner;
use crate::fork::{ForkCompletion, ForkHandle, HostChannel};
use crate::protocol::WorkerMessage;
use crate::status::StatusSink;

/// Connects worker contexts to the shared workers they ask for.
///
/// The relay owns the launch-once map of shared workers. Its tasks are
/// detached: nothing it spawns keeps the runtime busy beyond the worker
/// contexts it is observing.
#[derive(Clone)]
pub struct HostRelay {
    launcher: Arc<SharedWorkerLauncher>,
}

impl HostRelay {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, status: Arc<dyn StatusSink>) -> Self {
        Self {
            launcher: Arc::new(SharedWorkerLauncher::new(spawner, status)),
        }
    }

    pub fn launcher(&self) -> &SharedWorkerLauncher {
        &self.launcher
    }

    /// Serves every shared worker connection the given worker context asks
    /// for, until that context finishes.
    pub fn observe_worker_process(&self, mut fork: ForkHandle) -> JoinHandle<()> {
        let launcher = self.launcher.clone();
        tokio::spawn(async move {
            let completion = fork.completion();
            let fork_id = fork.fork_id().to_string();
            let file = fork.file().to_path_buf();
            debug!(%fork_id, ?file, "Observing worker context");

            loop {
                let channel = tokio::select! {
                    channel = fork.next_connection() => channel,
                    () = completion.clone().wait() => None,
                };
                let Some(channel) = channel else {
                    break;
                };

                let instance = launcher.launch(channel.filename(), channel.initial_data());
                tokio::spawn(relay_channel(
                    instance,
                    fork_id.clone(),
                    file.clone(),
                    channel,
                    completion.clone(),
                ));
            }
            debug!(%fork_id, "Worker context no longer connecting");
        })
    }
}

/// Pumps messages between one worker context and one shared worker for the
/// lifetime of the context.
async fn relay_channel(
    instance: Arc<SharedWorkerInstance>,
    fork_id: String,
    file: PathBuf,
    channel: HostChannel,
    completion: ForkCompletion,
) {
    let (mut from_fork, signals) = channel.into_parts();

    let readiness = tokio::select! {
        readiness = instance.readiness() => Some(readiness),
        () = completion.clone().wait() => None,
    };

    match readiness {
        Some(Readiness::Available) if instance.has_exited() => {
            debug!(%fork_id, shared_worker = %instance.id(), "Shared worker already exited");
            return;
        }
        Some(Readiness::Available) => {}
        Some(Readiness::Errored(err)) => {
            debug!(%fork_id, shared_worker = %instance.id(), %err, "Shared worker failed before becoming available");
            signals.signal_error();
            completion.wait().await;
            deregister(&instance, &fork_id);
            return;
        }
        Some(Readiness::Exited) => {
            // The context carries on without this shared worker.
            debug!(%fork_id, shared_worker = %instance.id(), "Shared worker exited before becoming available");
            return;
        }
        None => {
            deregister(&instance, &fork_id);
            return;
        }
    }

    let mut from_worker = instance.subscribe();
    info!(%fork_id, shared_worker = %instance.id(), "Registering worker context");
    instance.post(WorkerMessage::RegisterTestWorker {
        id: fork_id.clone(),
        file,
    });
    signals.signal_ready();

    let mut fork_open = true;
    let wait_for_completion = completion.wait();
    tokio::pin!(wait_for_completion);

    loop {
        tokio::select! {
            () = &mut wait_for_completion => break,
            message = from_fork.recv(), if fork_open => match message {
                Some(message) => {
                    instance.post(WorkerMessage::Message {
                        message_id: message.message_id,
                        test_worker_id: fork_id.clone(),
                        data: message.data,
                        reply_to: message.reply_to,
                    });
                }
                None => fork_open = false,
            },
            message = from_worker.recv() => match message {
                Some(message) if message.is_visible_to(&fork_id) => {
                    let Some(message) = (*message).clone().into_channel_message() else {
                        continue;
                    };
                    if !signals.forward_to_fork(message) {
                        debug!(%fork_id, "Worker context stopped listening");
                    }
                }
                Some(_) => {}
                None => {
                    if let InstanceState::Errored(err) = instance.state() {
                        warn!(%fork_id, shared_worker = %instance.id(), %err, "Shared worker failed");
                        signals.signal_error();
                    }
                    // Dropping the channel ends the context's streams.
                    info!(%fork_id, shared_worker = %instance.id(), "Shared worker went away");
                    return;
                }
            },
        }
    }

    info!(%fork_id, shared_worker = %instance.id(), "Deregistering worker context");
    deregister(&instance, &fork_id);
}

fn deregister(instance: &SharedWorkerInstance, fork_id: &str) {
    if !instance.post(WorkerMessage::DeregisterTestWorker {
        id: fork_id.to_string(),
    }) {
        debug!(%fork_id, shared_worker = %instance.id(), "Shared worker gone, skipping deregistration");
    }
}
