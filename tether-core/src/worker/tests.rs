use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, LocalSet};

use super::*;
use crate::loader::PluginRegistry;
use crate::protocol::ProtocolIdentifier;

const PLUGIN: &str = "plugins/test.rs";

struct Harness {
    to_worker: mpsc::UnboundedSender<WorkerMessage>,
    from_worker: mpsc::UnboundedReceiver<WorkerMessage>,
    worker: JoinHandle<Result<(), SharedWorkerError>>,
}

impl Harness {
    fn start(registry: PluginRegistry) -> Self {
        let (to_worker, inbound) = mpsc::unbounded_channel();
        let (outbound, from_worker) = mpsc::unbounded_channel();
        let data = WorkerData {
            filename: PathBuf::from(PLUGIN),
            id: "shared-worker/1".to_string(),
            initial_data: json!({"seed": 7}),
        };

        let worker = tokio::task::spawn_local(async move {
            run_shared_worker(data, WorkerTransport { outbound, inbound }, &registry).await
        });

        Self {
            to_worker,
            from_worker,
            worker,
        }
    }

    fn send(&self, message: WorkerMessage) {
        self.to_worker.send(message).unwrap();
    }

    fn register(&self, id: &str) {
        self.send(WorkerMessage::RegisterTestWorker {
            id: id.to_string(),
            file: PathBuf::from(format!("{id}.rs")),
        });
    }

    fn message(&self, from: &str, sequence: u64, data: Value, reply_to: Option<MessageId>) {
        self.send(WorkerMessage::Message {
            message_id: MessageId::new(from, sequence),
            test_worker_id: from.to_string(),
            data,
            reply_to,
        });
    }

    async fn next_outbound(&mut self) -> WorkerMessage {
        self.from_worker.recv().await.unwrap()
    }
}

/// Registers a plugin that hands its negotiated protocol to the test.
fn capturing_plugin() -> (PluginRegistry, mpsc::UnboundedReceiver<Protocol>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registry = PluginRegistry::new().register(PLUGIN, move |options: FactoryOptions| {
        let tx = tx.clone();
        async move {
            let protocol = options.negotiate_protocol(&[ProtocolIdentifier::EXPERIMENTAL])?;
            let _ = tx.send(protocol);
            anyhow::Ok(())
        }
    });
    (registry, rx)
}

async fn started() -> (Harness, Protocol) {
    let (registry, mut protocols) = capturing_plugin();
    let mut harness = Harness::start(registry);
    let protocol = protocols.recv().await.unwrap();
    assert_eq!(harness.next_outbound().await, WorkerMessage::Available);
    (harness, protocol)
}

#[tokio::test]
async fn test_unsupported_protocol_is_fatal() {
    LocalSet::new()
        .run_until(async {
            let registry = PluginRegistry::new().register(PLUGIN, |options: FactoryOptions| async move {
                // Swallowing the error does not keep the worker alive.
                let _ = options.negotiate_protocol(&[ProtocolIdentifier::new("v2")]);
                anyhow::Ok(())
            });
            let mut harness = Harness::start(registry);

            let error = (&mut harness.worker).await.unwrap().unwrap_err();
            assert!(matches!(error, SharedWorkerError::IncompatiblePlugin { .. }));
            let message = error.to_string();
            assert!(message.contains(PLUGIN));
            assert!(message.contains(crate::error::HOST_VERSION));

            assert!(harness.from_worker.recv().await.is_none());
        })
        .await;
}

#[tokio::test]
async fn test_factory_must_negotiate() {
    LocalSet::new()
        .run_until(async {
            let registry =
                PluginRegistry::new().register(PLUGIN, |_options: FactoryOptions| async move {
                    anyhow::Ok(())
                });
            let harness = Harness::start(registry);

            let error = harness.worker.await.unwrap().unwrap_err();
            assert!(matches!(error, SharedWorkerError::NotNegotiated(_)));
        })
        .await;
}

#[tokio::test]
async fn test_missing_plugin_fails_to_load() {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::start(PluginRegistry::new());

            let error = harness.worker.await.unwrap().unwrap_err();
            assert!(matches!(error, SharedWorkerError::Load { .. }));
        })
        .await;
}

#[tokio::test]
async fn test_initial_data_and_registration_order() {
    LocalSet::new()
        .run_until(async {
            let (harness, protocol) = started().await;
            assert_eq!(protocol.initial_data(), &json!({"seed": 7}));
            assert_eq!(protocol.protocol(), ProtocolIdentifier::EXPERIMENTAL);

            harness.register("a");
            harness.register("b");

            let workers = protocol.test_workers();
            let a = workers.next().await.unwrap();
            let b = workers.next().await.unwrap();
            assert_eq!(a.id(), "a");
            assert_eq!(a.file(), std::path::Path::new("a.rs"));
            assert_eq!(b.id(), "b");
        })
        .await;
}

#[tokio::test]
async fn test_streams_filter_by_sender_and_share_wrappers() {
    LocalSet::new()
        .run_until(async {
            let (harness, protocol) = started().await;
            harness.register("a");
            harness.register("b");
            let workers = protocol.test_workers();
            let a = workers.next().await.unwrap();
            let _b = workers.next().await.unwrap();

            let mut everything = protocol.subscribe();
            let mut from_a = a.subscribe();

            harness.message("b", 1, json!("from b"), None);
            harness.message("a", 1, json!("from a"), None);

            let first = everything.next().await.unwrap();
            assert_eq!(first.data(), &json!("from b"));
            assert_eq!(first.test_worker().id(), "b");

            let second = everything.next().await.unwrap();
            let only = from_a.next().await.unwrap();
            assert_eq!(only.data(), &json!("from a"));
            assert!(Arc::ptr_eq(&second, &only));
        })
        .await;
}

#[tokio::test]
async fn test_publish_targets_one_worker_and_collects_replies() {
    LocalSet::new()
        .run_until(async {
            let (mut harness, protocol) = started().await;
            harness.register("a");
            let a = protocol.test_workers().next().await.unwrap();

            let published = a.publish(json!({"question": 1}));
            match harness.next_outbound().await {
                WorkerMessage::Message {
                    message_id,
                    test_worker_id,
                    data,
                    reply_to,
                } => {
                    assert_eq!(&message_id, published.id());
                    assert_eq!(test_worker_id, "a");
                    assert_eq!(data, json!({"question": 1}));
                    assert_eq!(reply_to, None);
                }
                other => panic!("unexpected {other:?}"),
            }

            let mut replies = published.replies();
            let mut plain = a.subscribe();
            harness.message("a", 1, json!("unrelated reply"), Some(MessageId::new("x", 9)));
            harness.message("a", 2, json!("first"), Some(published.id().clone()));
            harness.message("a", 3, json!("plain"), None);
            harness.message("a", 4, json!("second"), Some(published.id().clone()));

            assert_eq!(replies.next().await.unwrap().data(), &json!("first"));
            assert_eq!(replies.next().await.unwrap().data(), &json!("second"));
            assert_eq!(plain.next().await.unwrap().data(), &json!("plain"));
        })
        .await;
}

#[tokio::test]
async fn test_reply_and_broadcast_ids() {
    LocalSet::new()
        .run_until(async {
            let (mut harness, protocol) = started().await;
            harness.register("a");
            let a = protocol.test_workers().next().await.unwrap();
            let mut stream = a.subscribe();

            harness.message("a", 1, json!("ping"), None);
            let ping = stream.next().await.unwrap();
            let pong = ping.reply(json!("pong"));
            let tick = protocol.broadcast(json!({"event": "tick"}));

            assert!(pong.id() < tick.id());
            assert_eq!(pong.id().scope(), "shared-worker/1");

            match harness.next_outbound().await {
                WorkerMessage::Message { reply_to, .. } => {
                    assert_eq!(reply_to, Some(MessageId::new("a", 1)))
                }
                other => panic!("unexpected {other:?}"),
            }
            match harness.next_outbound().await {
                WorkerMessage::Broadcast { message_id, data, .. } => {
                    assert_eq!(&message_id, tick.id());
                    assert_eq!(data, json!({"event": "tick"}));
                }
                other => panic!("unexpected {other:?}"),
            }
        })
        .await;
}

#[tokio::test]
async fn test_deregistration_ends_streams_and_runs_releases() {
    LocalSet::new()
        .run_until(async {
            let (harness, protocol) = started().await;
            harness.register("a");
            let a = protocol.test_workers().next().await.unwrap();
            let mut stream = a.subscribe();

            let runs = Arc::new(AtomicUsize::new(0));
            let early = {
                let runs = runs.clone();
                a.defer(move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            };
            {
                let runs = runs.clone();
                a.defer(move || {
                    runs.fetch_add(10, Ordering::SeqCst);
                });
            }
            early.release();
            early.release();
            assert_eq!(runs.load(Ordering::SeqCst), 1);

            harness.send(WorkerMessage::DeregisterTestWorker { id: "a".to_string() });
            a.exited().await;

            assert_eq!(runs.load(Ordering::SeqCst), 11);
            assert!(!a.is_registered());
            assert!(stream.next().await.is_none());
            assert!(stream.is_finished());
        })
        .await;
}

#[tokio::test]
async fn test_message_racing_deregistration_is_not_delivered() {
    LocalSet::new()
        .run_until(async {
            let (harness, protocol) = started().await;
            harness.register("a");
            let a = protocol.test_workers().next().await.unwrap();
            let mut stream = a.subscribe();
            let mut everything = protocol.subscribe();

            harness.message("a", 1, json!("late"), None);
            harness.send(WorkerMessage::DeregisterTestWorker { id: "a".to_string() });
            harness.register("b");
            harness.message("b", 1, json!("fresh"), None);

            assert!(stream.next().await.is_none());
            let next = everything.next().await.unwrap();
            assert_eq!(next.data(), &json!("fresh"));
        })
        .await;
}

#[tokio::test]
async fn test_host_disconnect_stops_worker() {
    LocalSet::new()
        .run_until(async {
            let (harness, protocol) = started().await;
            harness.register("a");
            let a = protocol.test_workers().next().await.unwrap();
            let runs = Arc::new(AtomicUsize::new(0));
            {
                let runs = runs.clone();
                a.defer(move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                });
            }

            let Harness {
                to_worker, worker, ..
            } = harness;
            drop(to_worker);

            worker.await.unwrap().unwrap();
            assert_eq!(runs.load(Ordering::SeqCst), 1);
            assert!(protocol.test_workers().next().await.is_none());
        })
        .await;
}
