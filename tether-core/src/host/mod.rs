//! Host relay.
//!
//! Runs in the coordinating process. It launches each shared worker once per
//! plugin file, registers worker contexts with it for as long as they run,
//! and pumps messages between them. A context only ever sees broadcasts and
//! messages addressed to it.

mod instance;
mod relay;
mod spawner;
#[cfg(test)]
mod testing;

pub use instance::{InstanceState, Readiness, SharedWorkerInstance, SharedWorkerLauncher};
pub use relay::HostRelay;
pub use spawner::{
    spawner_from_settings, ProcessSpawner, ThreadSpawner, WorkerConnection, WorkerEvent,
    WorkerSpawner,
};
