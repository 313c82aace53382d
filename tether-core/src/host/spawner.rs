//! Starting shared workers, either on a dedicated thread or as a child
//! process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, error, info, warn};

use crate::error::SerializedError;
use crate::loader::PluginLoader;
use crate::protocol::{WorkerData, WorkerMessage};
use crate::settings::{LaunchMode, Settings};
use crate::worker::{run_shared_worker, WorkerTransport};

/// What the host observes from a running shared worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(WorkerMessage),
    /// The worker failed. Always followed by [`WorkerEvent::Exit`].
    Error(SerializedError),
    Exit { code: Option<i32> },
}

/// The host's side of its link with a spawned shared worker.
///
/// Dropping `outbound` tells the worker the host has gone away.
pub struct WorkerConnection {
    pub outbound: mpsc::UnboundedSender<WorkerMessage>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, data: WorkerData) -> Result<WorkerConnection>;
}

/// Picks the spawner configured in `settings`.
///
/// Thread-launched workers resolve plugins through `loader`. Child processes
/// resolve them on their own.
pub fn spawner_from_settings(
    settings: &Settings,
    loader: Arc<dyn PluginLoader>,
) -> Arc<dyn WorkerSpawner> {
    match &settings.shared_workers.launch {
        LaunchMode::Thread => Arc::new(ThreadSpawner::new(loader)),
        LaunchMode::Process { program, args } => {
            Arc::new(ProcessSpawner::new(program.clone()).with_args(args.clone()))
        }
    }
}

/// Runs each shared worker on its own OS thread with a single-threaded
/// runtime.
pub struct ThreadSpawner {
    loader: Arc<dyn PluginLoader>,
}

impl ThreadSpawner {
    pub fn new(loader: Arc<dyn PluginLoader>) -> Self {
        Self { loader }
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(&self, data: WorkerData) -> Result<WorkerConnection> {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let loader = self.loader.clone();
        let name = data.id.clone();

        // The thread is detached. It ends once the host drops `outbound`.
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_on_thread(data, inbound, events_tx, loader))
            .with_context(|| format!("Failed to start thread for {name}"))?;

        Ok(WorkerConnection { outbound, events })
    }
}

fn run_on_thread(
    data: WorkerData,
    inbound: mpsc::UnboundedReceiver<WorkerMessage>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    loader: Arc<dyn PluginLoader>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = events.send(WorkerEvent::Error(SerializedError::new(
                "RuntimeError",
                format!("Failed to build shared worker runtime: {err}"),
            )));
            let _ = events.send(WorkerEvent::Exit { code: None });
            return;
        }
    };

    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        let (outbound, mut from_worker) = mpsc::unbounded_channel();
        let worker = run_shared_worker(data, WorkerTransport { outbound, inbound }, loader.as_ref());
        tokio::pin!(worker);

        let result = loop {
            tokio::select! {
                biased;
                Some(message) = from_worker.recv() => {
                    let _ = events.send(WorkerEvent::Message(message));
                }
                result = &mut worker => break result,
            }
        };
        while let Ok(message) = from_worker.try_recv() {
            let _ = events.send(WorkerEvent::Message(message));
        }

        let code = match result {
            Ok(()) => 0,
            Err(err) => {
                error!("Shared worker failed: {err}");
                let _ = events.send(WorkerEvent::Error(SerializedError::from_error(
                    "SharedWorkerError",
                    &err,
                )));
                1
            }
        };
        let _ = events.send(WorkerEvent::Exit { code: Some(code) });
    });
}

/// Runs each shared worker as a child process that speaks JSON lines over
/// stdin/stdout, such as the `tether-subprocess` binary.
///
/// The child receives `--filename`, `--id` and `--initial-data` after any
/// configured arguments.
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, data: WorkerData) -> Result<WorkerConnection> {
        let initial_data = serde_json::to_string(&data.initial_data)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--filename")
            .arg(&data.filename)
            .arg("--id")
            .arg(&data.id)
            .arg("--initial-data")
            .arg(initial_data)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to spawn shared worker process '{}'",
                    self.program.display()
                )
            })?;
        info!(shared_worker = %data.id, pid = ?child.id(), "Spawned shared worker process");

        let mut stdin = child
            .stdin
            .take()
            .context("Shared worker stdin is unavailable")?;
        let stdout = child
            .stdout
            .take()
            .context("Shared worker stdout is unavailable")?;
        let stderr = child
            .stderr
            .take()
            .context("Shared worker stderr is unavailable")?;

        let (outbound, mut to_child) = mpsc::unbounded_channel::<WorkerMessage>();
        let (events_tx, events) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = to_child.recv().await {
                let json = format!("{}\n", serde_json::to_string(&message)?);
                stdin.write_all(json.as_bytes()).await?;
                stdin.flush().await?;
            }
            // Closing stdin tells the child the host is gone.
            anyhow::Ok(())
        });

        let stderr_handle: JoinHandle<Result<String, std::io::Error>> = tokio::spawn(async move {
            let mut buf = String::new();
            BufReader::new(stderr).read_to_string(&mut buf).await?;
            Ok(buf)
        });

        let id = data.id;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<WorkerMessage>(&line) {
                        Ok(message) => {
                            let _ = events_tx.send(WorkerEvent::Message(message));
                        }
                        Err(err) => warn!(shared_worker = %id, "Ignoring malformed line: {err}. Line: {line}"),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(shared_worker = %id, "Failed reading shared worker stdout: {err}");
                        break;
                    }
                }
            }

            let status = child.wait().await;
            let stderr_output = match stderr_handle.await {
                Ok(Ok(text)) => text,
                Ok(Err(err)) => {
                    warn!("Failed reading shared worker stderr: {err}");
                    String::new()
                }
                Err(err) => {
                    warn!("Failed awaiting shared worker stderr: {err}");
                    String::new()
                }
            };
            debug!(shared_worker = %id, stderr = %stderr_output, "Shared worker process output");

            let code = match status {
                Ok(status) if status.success() => status.code(),
                Ok(status) => {
                    let mut err = SerializedError::new(
                        "SharedWorkerError",
                        format!("Shared worker process exited with {status}"),
                    );
                    if let Some(line) = last_line(&stderr_output) {
                        err.chain.push(line.to_string());
                    }
                    let _ = events_tx.send(WorkerEvent::Error(err));
                    status.code()
                }
                Err(err) => {
                    let _ = events_tx.send(WorkerEvent::Error(SerializedError::new(
                        "SharedWorkerError",
                        format!("Failed waiting for shared worker process: {err}"),
                    )));
                    None
                }
            };
            let _ = events_tx.send(WorkerEvent::Exit { code });
        });

        Ok(WorkerConnection { outbound, events })
    }
}

fn last_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
}
