use std::env;
use std::path::PathBuf;

use anyhow::Context;
use serde_json::Value;
use tether_core::protocol::WorkerData;
use tether_subprocess::{plugins, run_subprocess};
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TETHER_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args: Vec<String> = env::args().collect();
    let mut filename: Option<PathBuf> = None;
    let mut id: Option<String> = None;
    let mut initial_data = Value::Null;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--filename" => {
                i += 1;
                if i < args.len() {
                    filename = Some(PathBuf::from(&args[i]));
                }
            }
            "--id" => {
                i += 1;
                if i < args.len() {
                    id = Some(args[i].clone());
                }
            }
            "--initial-data" => {
                i += 1;
                if i < args.len() {
                    initial_data = serde_json::from_str(&args[i])?;
                }
            }
            _ => {}
        }
        i += 1;
    }

    let data = WorkerData {
        filename: filename.context("--filename is required")?,
        id: id.unwrap_or_else(|| "shared-worker/1".to_string()),
        initial_data,
    };

    let loader = plugins::builtin();
    let local = LocalSet::new();
    local.run_until(run_subprocess(data, &loader)).await?;
    Ok(())
}
