use std::io::BufRead;
use std::thread;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tokio::{io, io::AsyncWriteExt};
use tracing::{info, warn};
use tether_core::loader::PluginLoader;
use tether_core::protocol::{WorkerData, WorkerMessage};
use tether_core::worker::{run_shared_worker, WorkerTransport};

pub mod plugins;

/// Runs a shared worker that talks to its host over stdin/stdout, one JSON
/// message per line. Must run inside a `LocalSet`.
///
/// Returns once the host closes stdin, or with the worker's error. Stdin is
/// read on its own thread, so an error return does not wait for the host to
/// close the pipe.
pub async fn run_subprocess(data: WorkerData, loader: &dyn PluginLoader) -> anyhow::Result<()> {
    let (to_worker, inbound) = mpsc::unbounded_channel::<WorkerMessage>();
    let (outbound, mut from_worker) = mpsc::unbounded_channel::<WorkerMessage>();
    let (done_tx, mut done_rx) = oneshot::channel::<()>();

    let writer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        let mut done = false;
        loop {
            let message = if done {
                from_worker.try_recv().ok()
            } else {
                tokio::select! {
                    biased;
                    message = from_worker.recv() => message,
                    _ = &mut done_rx => {
                        done = true;
                        continue;
                    }
                }
            };
            let Some(message) = message else {
                break;
            };
            let json = serde_json::to_string(&message)?;
            let json = format!("{json}\n");
            stdout.write_all(json.as_bytes()).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    // Blocking reads stay off the runtime so it can shut down while the host
    // still holds stdin open.
    let reader = thread::Builder::new()
        .name("tether-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let message: WorkerMessage = serde_json::from_str(&line)?;
                if to_worker.send(message).is_err() {
                    return anyhow::Ok(());
                }
            }
            info!("Host closed stdin");
            anyhow::Ok(())
        })?;

    let result = run_shared_worker(data, WorkerTransport { outbound, inbound }, loader).await;

    // Everything the worker posted must reach the host before we exit.
    let _ = done_tx.send(());
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed writing to host: {e}"),
        Err(panic) => warn!("Writer task failed: {panic}"),
    }

    result?;

    if reader.is_finished() {
        return match reader.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("stdin reader panicked")),
        };
    }
    // Left blocked on stdin; it ends with the process.
    Ok(())
}
