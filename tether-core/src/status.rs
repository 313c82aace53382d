use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SerializedError;

/// State changes the relay reports to whoever aggregates run status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StateChange {
    SharedWorkerError { err: SerializedError },
}

pub trait StatusSink: Send + Sync {
    fn emit_state_change(&self, change: StateChange);
}

/// Forwards state changes into an unbounded channel.
#[derive(Clone)]
pub struct StatusSender {
    tx: mpsc::UnboundedSender<StateChange>,
}

impl StatusSender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StateChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for StatusSender {
    fn emit_state_change(&self, change: StateChange) {
        // Nobody listening is not an error for the relay.
        let _ = self.tx.send(change);
    }
}
