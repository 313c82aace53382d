//! Context facade.
//!
//! Runs inside each worker context. It checks that shared workers may be
//! used at all, hands out one [`SharedWorker`] per plugin file, and runs the
//! teardown callbacks callers registered when the context finishes.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{SharedWorkerError, HOST_VERSION};
use crate::fork::ForkRuntime;
use crate::protocol::{self, ProtocolIdentifier};
use crate::settings::Settings;

mod handle;
mod message;

pub use handle::SharedWorker;
pub use message::{MessageStream, PublishedMessage, ReceivedMessage};

type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Arguments for [`SharedWorkers::register`].
pub struct RegistrationOptions {
    filename: PathBuf,
    initial_data: Value,
    supported_protocols: Vec<ProtocolIdentifier>,
    teardown: Option<Teardown>,
}

impl RegistrationOptions {
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            initial_data: Value::Null,
            supported_protocols: vec![],
            teardown: None,
        }
    }

    /// Data handed to the shared worker if this registration launches it.
    pub fn initial_data(mut self, data: Value) -> Self {
        self.initial_data = data;
        self
    }

    pub fn supported_protocols(mut self, protocols: Vec<ProtocolIdentifier>) -> Self {
        self.supported_protocols = protocols;
        self
    }

    /// Runs when the context finishes, alongside every other teardown
    /// registered for the same shared worker.
    pub fn teardown<F, Fut>(mut self, teardown: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.teardown = Some(Box::new(move || teardown().boxed()));
        self
    }
}

/// Shared workers used by one worker context.
pub struct SharedWorkers {
    runtime: ForkRuntime,
    enabled: bool,
    workers: Mutex<HashMap<PathBuf, Registered>>,
}

struct Registered {
    worker: Arc<SharedWorker>,
    teardowns: Vec<Teardown>,
}

impl SharedWorkers {
    pub fn new(runtime: ForkRuntime, settings: &Settings) -> Self {
        Self {
            runtime,
            enabled: settings.experiments.shared_workers,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn fork_id(&self) -> &str {
        self.runtime.fork_id()
    }

    /// Connects to the shared worker for `options.filename`.
    ///
    /// Fails straight away, without launching anything, if shared workers
    /// are not enabled or supported, or if none of the requested protocols
    /// is implemented. Repeated registrations of the same file return the
    /// same handle.
    pub fn register(
        &self,
        options: RegistrationOptions,
    ) -> Result<Arc<SharedWorker>, SharedWorkerError> {
        if !self.enabled {
            return Err(SharedWorkerError::NotEnabled);
        }
        if !self.runtime.supports_shared_workers() {
            return Err(SharedWorkerError::Unsupported(
                "this worker context has no host relay".to_string(),
            ));
        }
        if !protocol::is_supported(&options.supported_protocols) {
            return Err(SharedWorkerError::UnsupportedProtocols {
                version: HOST_VERSION,
                requested: options.supported_protocols,
            });
        }

        let RegistrationOptions {
            filename,
            initial_data,
            teardown,
            ..
        } = options;

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let registered = match workers.entry(filename) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let filename = entry.key().clone();
                let channel = self
                    .runtime
                    .connect_shared_worker(filename.clone(), initial_data)?;
                debug!(fork_id = %self.fork_id(), ?filename, "Connected to shared worker");
                entry.insert(Registered {
                    worker: Arc::new(SharedWorker::connect(filename, channel)),
                    teardowns: vec![],
                })
            }
        };

        registered.teardowns.extend(teardown);
        Ok(registered.worker.clone())
    }

    /// Runs every registered teardown concurrently, then reports the
    /// context as finished so the host deregisters it.
    pub async fn finish(self) {
        let teardowns: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .flat_map(|(_, registered)| registered.teardowns)
            .map(|teardown| teardown())
            .collect();

        info!(fork_id = %self.fork_id(), teardowns = teardowns.len(), "Finishing worker context");
        join_all(teardowns).await;
        self.runtime.finish();
    }
}
