use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use super::registry::{Release, TestWorkerState};
use super::stream::MessageStream;
use super::WorkerShared;
use crate::protocol::MessageId;

/// A worker context as seen by plugin code inside the shared worker.
#[derive(Clone)]
pub struct TestWorker {
    pub(crate) state: Arc<TestWorkerState>,
    pub(crate) shared: Arc<WorkerShared>,
}

impl TestWorker {
    pub(crate) fn new(state: Arc<TestWorkerState>, shared: Arc<WorkerShared>) -> Self {
        Self { state, shared }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn file(&self) -> &Path {
        &self.state.file
    }

    /// Sends `data` to this worker context only.
    pub fn publish(&self, data: Value) -> PublishedMessage {
        self.shared.publish(Some(self.clone()), data, None)
    }

    /// Messages this worker context publishes, excluding replies.
    pub fn subscribe(&self) -> MessageStream {
        self.shared.subscribe(Some(self.clone()), None)
    }

    /// Runs `f` when this worker context deregisters, unless released first.
    pub fn defer<F>(&self, f: F) -> Release
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.defer(Box::new(f))
    }

    /// Resolves once the worker context has deregistered.
    pub async fn exited(&self) {
        let mut exited = self.state.exited();
        // A dropped sender means the state is gone, which also counts.
        let _ = exited.wait_for(|exited| *exited).await;
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registry.is_current(&self.state)
    }
}

impl PartialEq for TestWorker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl std::fmt::Debug for TestWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestWorker")
            .field("id", &self.state.id)
            .field("file", &self.state.file)
            .finish()
    }
}

/// A message a worker context sent to the shared worker.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub(crate) id: MessageId,
    pub(crate) data: Value,
    pub(crate) reply_to: Option<MessageId>,
    pub(crate) test_worker: TestWorker,
}

impl ReceivedMessage {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn reply_to(&self) -> Option<&MessageId> {
        self.reply_to.as_ref()
    }

    pub fn test_worker(&self) -> &TestWorker {
        &self.test_worker
    }

    /// Answers this message. Only the sending worker context receives it.
    pub fn reply(&self, data: Value) -> PublishedMessage {
        self.test_worker
            .shared
            .publish(Some(self.test_worker.clone()), data, Some(self.id.clone()))
    }
}

/// Handle to a message sent by the shared worker.
pub struct PublishedMessage {
    pub(crate) id: MessageId,
    pub(crate) target: Option<TestWorker>,
    pub(crate) shared: Arc<WorkerShared>,
}

/// Broadcasts carry no target but otherwise behave like directed messages.
pub type BroadcastMessage = PublishedMessage;

impl PublishedMessage {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Replies to this message, from its target when it had one.
    pub fn replies(&self) -> MessageStream {
        self.shared
            .subscribe(self.target.clone(), Some(self.id.clone()))
    }
}
