//! Wire vocabulary shared by the host relay, the shared worker entry and
//! worker contexts.
//!
//! Everything here derives serde so the same messages can travel over an
//! in-process channel or be serialized to JSON lines for a shared worker
//! running in a child process.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Identifies a revision of the shared worker protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolIdentifier(Cow<'static, str>);

impl ProtocolIdentifier {
    pub const EXPERIMENTAL: ProtocolIdentifier = ProtocolIdentifier(Cow::Borrowed("experimental"));

    pub fn new(identifier: impl Into<String>) -> Self {
        Self(Cow::Owned(identifier.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The only protocol this version implements.
pub const CURRENT_PROTOCOL: ProtocolIdentifier = ProtocolIdentifier::EXPERIMENTAL;

pub fn is_supported(requested: &[ProtocolIdentifier]) -> bool {
    requested.contains(&CURRENT_PROTOCOL)
}

/// Message identifier of the form `<scope>/message/<sequence>`.
///
/// The scope names the sender (a shared worker instance or a fork) and the
/// sequence is strictly increasing within that scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    scope: Arc<str>,
    sequence: u64,
}

impl MessageId {
    pub fn new(scope: impl Into<Arc<str>>, sequence: u64) -> Self {
        Self {
            scope: scope.into(),
            sequence,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/message/{}", self.scope, self.sequence)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid message id: {0}")]
pub struct InvalidMessageId(String);

impl FromStr for MessageId {
    type Err = InvalidMessageId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scope, sequence) = s
            .rsplit_once("/message/")
            .ok_or_else(|| InvalidMessageId(s.to_string()))?;
        let sequence = sequence
            .parse()
            .map_err(|_| InvalidMessageId(s.to_string()))?;
        Ok(Self::new(scope, sequence))
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Hands out message ids for one sender scope.
#[derive(Debug, Clone)]
pub struct MessageIdGenerator {
    scope: Arc<str>,
    counter: Arc<AtomicU64>,
}

impl MessageIdGenerator {
    pub fn new(scope: impl Into<Arc<str>>) -> Self {
        Self {
            scope: scope.into(),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn next_id(&self) -> MessageId {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        MessageId {
            scope: self.scope.clone(),
            sequence,
        }
    }
}

/// Payload exchanged between a worker context and the host relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    pub data: Value,
}

/// Control and data messages exchanged between the host relay and a shared
/// worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// Sent once by the shared worker after a successful negotiation.
    Available,

    RegisterTestWorker {
        id: String,
        file: PathBuf,
    },

    DeregisterTestWorker {
        id: String,
    },

    /// Directed traffic. Towards the shared worker `test_worker_id` names
    /// the sender, from the shared worker it names the target.
    #[serde(rename_all = "camelCase")]
    Message {
        message_id: MessageId,
        test_worker_id: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },

    #[serde(rename_all = "camelCase")]
    Broadcast {
        message_id: MessageId,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },
}

impl WorkerMessage {
    /// Whether a message coming out of a shared worker may be forwarded to the
    /// given fork.
    pub fn is_visible_to(&self, fork_id: &str) -> bool {
        match self {
            WorkerMessage::Broadcast { .. } => true,
            WorkerMessage::Message { test_worker_id, .. } => test_worker_id == fork_id,
            _ => false,
        }
    }

    /// Strips routing information, leaving what a worker context sees.
    pub fn into_channel_message(self) -> Option<ChannelMessage> {
        match self {
            WorkerMessage::Message {
                message_id,
                data,
                reply_to,
                ..
            }
            | WorkerMessage::Broadcast {
                message_id,
                data,
                reply_to,
            } => Some(ChannelMessage {
                message_id,
                reply_to,
                data,
            }),
            _ => None,
        }
    }
}

/// Launch parameters handed to a shared worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerData {
    pub filename: PathBuf,
    pub id: String,
    #[serde(default)]
    pub initial_data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_ids_increase_per_scope() {
        let ids = MessageIdGenerator::new("shared-worker/1");
        let first = ids.next_id();
        let second = ids.next_id();
        let third = ids.clone().next_id();

        assert_eq!(first.to_string(), "shared-worker/1/message/1");
        assert!(first < second && second < third);
        assert_eq!(third.sequence(), 3);
        assert_eq!(third.scope(), "shared-worker/1");
    }

    #[test]
    fn test_message_id_parses_scopes_containing_slashes() {
        let id: MessageId = "shared-worker/7/message/42".parse().unwrap();
        assert_eq!(id.scope(), "shared-worker/7");
        assert_eq!(id.sequence(), 42);

        assert!("shared-worker/7".parse::<MessageId>().is_err());
        assert!("fork/message/abc".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_worker_message_wire_format() {
        let message = WorkerMessage::Message {
            message_id: MessageId::new("fork-a", 3),
            test_worker_id: "fork-a".to_string(),
            data: json!({"x": 1}),
            reply_to: None,
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "message",
                "messageId": "fork-a/message/3",
                "testWorkerId": "fork-a",
                "data": {"x": 1}
            })
        );

        let register: WorkerMessage =
            serde_json::from_value(json!({"type": "register-test-worker", "id": "a", "file": "a.rs"}))
                .unwrap();
        assert_eq!(
            register,
            WorkerMessage::RegisterTestWorker {
                id: "a".to_string(),
                file: PathBuf::from("a.rs"),
            }
        );
    }

    #[test]
    fn test_visibility_isolates_directed_traffic() {
        let directed = WorkerMessage::Message {
            message_id: MessageId::new("shared-worker/1", 1),
            test_worker_id: "a".to_string(),
            data: Value::Null,
            reply_to: None,
        };
        let broadcast = WorkerMessage::Broadcast {
            message_id: MessageId::new("shared-worker/1", 2),
            data: Value::Null,
            reply_to: None,
        };

        assert!(directed.is_visible_to("a"));
        assert!(!directed.is_visible_to("b"));
        assert!(broadcast.is_visible_to("b"));
        assert!(!WorkerMessage::Available.is_visible_to("a"));
    }

    #[test]
    fn test_protocol_support() {
        assert!(is_supported(&[ProtocolIdentifier::new("v9"), ProtocolIdentifier::EXPERIMENTAL]));
        assert!(!is_supported(&[ProtocolIdentifier::new("v9")]));
        assert!(!is_supported(&[]));
    }
}
