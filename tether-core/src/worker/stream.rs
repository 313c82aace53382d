use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::registry::TestWorkerRegistry;
use super::test_worker::{ReceivedMessage, TestWorker};
use crate::bus::Subscription;
use crate::protocol::MessageId;

/// Live, filtered view of messages arriving at the shared worker.
///
/// Only messages that arrive after the stream was created are observed. A
/// stream bound to a worker context ends when that context deregisters.
/// Dropping the stream releases its subscription.
pub struct MessageStream {
    subscription: Option<Subscription<ReceivedMessage>>,
    test_worker: Option<TestWorker>,
    reply_to: Option<MessageId>,
    registry: TestWorkerRegistry,
    exited: Option<watch::Receiver<bool>>,
}

impl MessageStream {
    pub(crate) fn new(
        subscription: Subscription<ReceivedMessage>,
        test_worker: Option<TestWorker>,
        reply_to: Option<MessageId>,
        registry: TestWorkerRegistry,
    ) -> Self {
        let exited = test_worker.as_ref().map(|worker| worker.state.exited());
        Self {
            subscription: Some(subscription),
            test_worker,
            reply_to,
            registry,
            exited,
        }
    }

    /// Waits for the next matching message, or `None` once the stream ended.
    pub async fn next(&mut self) -> Option<Arc<ReceivedMessage>> {
        loop {
            let subscription = self.subscription.as_mut()?;
            let message = match self.exited.as_mut() {
                Some(exited) => tokio::select! {
                    biased;
                    message = subscription.recv() => message,
                    _ = exited.wait_for(|exited| *exited) => None,
                },
                None => subscription.recv().await,
            };

            let Some(message) = message else {
                self.finish();
                return None;
            };

            if let Some(worker) = &self.test_worker {
                if message.test_worker != *worker {
                    continue;
                }
            }

            if message.reply_to != self.reply_to {
                continue;
            }

            // Let a deregistration that arrived in the same turn settle before
            // handing the message out.
            tokio::task::yield_now().await;

            if !self.registry.is_current(&message.test_worker.state) {
                if self.test_worker.is_some() {
                    debug!(message_id = %message.id, "Worker context ended, closing its message stream");
                    self.finish();
                    return None;
                }
                debug!(message_id = %message.id, "Dropping message from deregistered worker context");
                continue;
            }

            return Some(message);
        }
    }

    /// Whether the stream has ended.
    pub fn is_finished(&self) -> bool {
        self.subscription.is_none()
    }

    fn finish(&mut self) {
        self.subscription = None;
        self.exited = None;
    }
}
