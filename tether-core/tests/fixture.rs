use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tracing_subscriber;
use tether_core::{
    fork,
    host::{HostRelay, ThreadSpawner},
    settings::{manager::SettingsManager, Settings},
    status::{StateChange, StatusSender},
    worker::{FactoryOptions, TestWorker},
    PluginRegistry, ProtocolIdentifier, RegistrationOptions, SharedWorker, SharedWorkers,
};

/// Routes messages between worker contexts on request.
pub const ROUTER: &str = "plugins/router.rs";
/// Asks for a protocol this version does not implement.
pub const INCOMPATIBLE: &str = "plugins/incompatible.rs";

pub struct Fixture {
    pub relay: HostRelay,
    pub status_rx: mpsc::UnboundedReceiver<StateChange>,
    pub settings: Settings,
    #[allow(dead_code)]
    pub settings_dir: TempDir,
}

impl Fixture {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::with_settings(Settings::with_shared_workers())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        // Keep settings in the tempdir to avoid touching the user's real ones
        let settings_dir = TempDir::new().unwrap();
        let settings_path = settings_dir.path().join(".tether").join("settings.toml");
        let settings_manager = SettingsManager::from_path(settings_path).unwrap();
        settings_manager.save_settings(settings).unwrap();

        let (status, status_rx) = StatusSender::new();
        let spawner = ThreadSpawner::new(Arc::new(plugins()));
        let relay = HostRelay::new(Arc::new(spawner), Arc::new(status));

        Fixture {
            relay,
            status_rx,
            settings: settings_manager.settings(),
            settings_dir,
        }
    }

    /// Starts a worker context for `file` and has the relay observe it.
    pub fn context(&self, file: &str) -> TestContext {
        let (handle, runtime) = fork::fork_for(file);
        let fork_id = handle.fork_id().to_string();
        self.relay.observe_worker_process(handle);

        TestContext {
            fork_id,
            workers: SharedWorkers::new(runtime, &self.settings),
        }
    }

    pub async fn next_state_change(&mut self) -> StateChange {
        self.status_rx
            .recv()
            .await
            .expect("status sink closed unexpectedly")
    }
}

pub struct TestContext {
    pub fork_id: String,
    pub workers: SharedWorkers,
}

impl TestContext {
    pub fn register(&self, filename: &str) -> Arc<SharedWorker> {
        self.register_with(filename, Value::Null)
    }

    pub fn register_with(&self, filename: &str, initial_data: Value) -> Arc<SharedWorker> {
        self.workers
            .register(
                RegistrationOptions::new(filename)
                    .initial_data(initial_data)
                    .supported_protocols(vec![ProtocolIdentifier::EXPERIMENTAL]),
            )
            .unwrap()
    }

    /// Registers the router and waits until it can be used.
    pub async fn router(&self) -> Arc<SharedWorker> {
        let worker = self.register(ROUTER);
        worker.available().await.unwrap();
        worker
    }
}

fn plugins() -> PluginRegistry {
    PluginRegistry::new()
        .register(ROUTER, router)
        .register(INCOMPATIBLE, |options: FactoryOptions| async move {
            options.negotiate_protocol(&[ProtocolIdentifier::new("v2")])?;
            anyhow::Ok(())
        })
}

/// Understands a handful of `op`s:
///
/// - `echo`: replies once per entry of `replies`, in order
/// - `broadcast`: broadcasts `data`
/// - `forward`: sends `{from, data}` to every other registered context
/// - `send`: sends `data` to the context named by `to`
/// - `initial`: replies with the initial data
/// - `fail`: makes the plugin fail
///
/// Broadcasts `{released: id}` when a context deregisters.
async fn router(options: FactoryOptions) -> anyhow::Result<()> {
    let protocol = options.negotiate_protocol(&[ProtocolIdentifier::EXPERIMENTAL])?;
    let known: Rc<RefCell<BTreeMap<String, TestWorker>>> = Default::default();

    let registrations = protocol.test_workers();
    let tracked = known.clone();
    let on_release = protocol.clone();
    tokio::task::spawn_local(async move {
        while let Some(worker) = registrations.next().await {
            let id = worker.id().to_string();
            let protocol = on_release.clone();
            worker.defer(move || {
                protocol.broadcast(json!({ "released": id }));
            });
            tracked.borrow_mut().insert(worker.id().to_string(), worker);
        }
    });

    let mut messages = protocol.subscribe();
    while let Some(message) = messages.next().await {
        let data = message.data();
        let sender = message.test_worker().id().to_string();
        match data["op"].as_str().unwrap_or_default() {
            "echo" => {
                for reply in data["replies"].as_array().cloned().unwrap_or_default() {
                    message.reply(reply);
                }
            }
            "broadcast" => {
                protocol.broadcast(data["data"].clone());
            }
            "forward" => {
                for (id, worker) in known.borrow().iter() {
                    if *id != sender {
                        worker.publish(json!({ "from": sender, "data": data["data"] }));
                    }
                }
            }
            "send" => {
                let target = data["to"].as_str().unwrap_or_default();
                if let Some(worker) = known.borrow().get(target) {
                    worker.publish(data["data"].clone());
                }
            }
            "initial" => {
                message.reply(protocol.initial_data().clone());
            }
            "fail" => anyhow::bail!("router was asked to fail"),
            other => tracing::warn!("router ignoring op {other:?}"),
        }
    }
    Ok(())
}

pub fn run<F, Fut>(test_fn: F)
where
    F: FnOnce(Fixture) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    run_with_settings(Settings::with_shared_workers(), test_fn)
}

pub fn run_with_settings<F, Fut>(settings: Settings, test_fn: F)
where
    F: FnOnce(Fixture) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    use tokio::time::{timeout, Duration};

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    let local = tokio::task::LocalSet::new();

    runtime.block_on(local.run_until(async {
        let fixture = Fixture::with_settings(settings);
        let test_future = test_fn(fixture);
        timeout(Duration::from_secs(30), test_future)
            .await
            .expect("Test timed out after 30 seconds");
    }));
}
