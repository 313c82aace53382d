use serde_json::Value;

use crate::bus::{EventBus, Subscription};
use crate::error::SharedWorkerError;
use crate::fork::ChannelPoster;
use crate::protocol::MessageId;

/// What messages need to answer, and to hand out reply streams.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) poster: ChannelPoster,
    pub(crate) bus: EventBus<ReceivedMessage>,
}

impl Link {
    pub(crate) fn publish(
        &self,
        data: Value,
        reply_to: Option<MessageId>,
    ) -> Result<PublishedMessage, SharedWorkerError> {
        let id = self.poster.post(data, reply_to)?;
        Ok(PublishedMessage {
            id,
            link: self.clone(),
        })
    }

    pub(crate) fn subscribe(&self, reply_to: Option<MessageId>) -> MessageStream {
        MessageStream {
            subscription: Some(self.bus.subscribe()),
            reply_to,
        }
    }
}

/// A message from the shared worker, as seen by a worker context.
pub struct ReceivedMessage {
    id: MessageId,
    data: Value,
    reply_to: Option<MessageId>,
    link: Link,
}

impl ReceivedMessage {
    pub(crate) fn new(
        id: MessageId,
        data: Value,
        reply_to: Option<MessageId>,
        link: Link,
    ) -> Self {
        Self {
            id,
            data,
            reply_to,
            link,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn reply_to(&self) -> Option<&MessageId> {
        self.reply_to.as_ref()
    }

    /// Answers this message.
    pub fn reply(&self, data: Value) -> Result<PublishedMessage, SharedWorkerError> {
        self.link.publish(data, Some(self.id.clone()))
    }
}

impl std::fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("id", &self.id)
            .field("data", &self.data)
            .field("reply_to", &self.reply_to)
            .finish()
    }
}

/// A message this context sent to the shared worker.
pub struct PublishedMessage {
    id: MessageId,
    link: Link,
}

impl PublishedMessage {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Replies to this message that arrive from now on.
    pub fn replies(&self) -> MessageStream {
        self.link.subscribe(Some(self.id.clone()))
    }
}

/// Live view of messages from the shared worker.
///
/// Without a reply filter only messages that are not replies are observed.
/// Every stream holding a given message gets the same `Arc`.
pub struct MessageStream {
    subscription: Option<Subscription<ReceivedMessage>>,
    reply_to: Option<MessageId>,
}

impl MessageStream {
    /// Waits for the next matching message, or `None` once the connection to
    /// the shared worker is gone.
    pub async fn next(&mut self) -> Option<std::sync::Arc<ReceivedMessage>> {
        loop {
            let subscription = self.subscription.as_mut()?;
            let Some(message) = subscription.recv().await else {
                self.subscription = None;
                return None;
            };
            if message.reply_to == self.reply_to {
                return Some(message);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.subscription.is_none()
    }
}
