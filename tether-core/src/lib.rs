pub mod bus;
pub mod context;
pub mod error;
pub mod fork;
pub mod host;
pub mod loader;
pub mod protocol;
pub mod settings;
pub mod status;
pub mod worker;

// Public library API. Embedders should mostly need the types below; the
// modules stay public for anything more specialised.
pub use context::{RegistrationOptions, SharedWorker, SharedWorkers};
pub use error::{SerializedError, SharedWorkerError};
pub use fork::{fork, fork_for, ForkHandle, ForkRuntime};
pub use host::{HostRelay, ProcessSpawner, ThreadSpawner, WorkerSpawner};
pub use loader::{PluginLoader, PluginRegistry, SharedWorkerFactory};
pub use protocol::{MessageId, ProtocolIdentifier};
pub use settings::{Settings, SettingsManager};
pub use status::{StateChange, StatusSink};
pub use worker::{run_shared_worker, FactoryOptions, Protocol};
