use std::sync::Mutex;

use tokio::sync::mpsc;

use super::spawner::{WorkerConnection, WorkerEvent, WorkerSpawner};
use crate::protocol::{WorkerData, WorkerMessage};

/// Hands out scripted connections and remembers what it was asked to
/// launch.
#[derive(Default)]
pub(crate) struct ScriptedSpawner {
    pub(crate) launched: Mutex<Vec<WorkerData>>,
    pub(crate) events: Mutex<Vec<mpsc::UnboundedSender<WorkerEvent>>>,
    pub(crate) fail: bool,
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(&self, data: WorkerData) -> anyhow::Result<WorkerConnection> {
        if self.fail {
            anyhow::bail!("cannot launch {}", data.filename.display());
        }
        let (outbound, _inbound) = mpsc::unbounded_channel::<WorkerMessage>();
        let (events_tx, events) = mpsc::unbounded_channel();
        self.launched.lock().unwrap().push(data);
        self.events.lock().unwrap().push(events_tx);
        Ok(WorkerConnection { outbound, events })
    }
}

impl ScriptedSpawner {
    pub(crate) fn emit(&self, index: usize, event: WorkerEvent) {
        self.events.lock().unwrap()[index].send(event).unwrap();
    }
}
