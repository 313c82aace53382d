//! Plugins served by the `tether-subprocess` binary.

use std::time::Duration;

use serde_json::json;
use tether_core::loader::PluginRegistry;
use tether_core::worker::FactoryOptions;
use tether_core::ProtocolIdentifier;

/// Replies to every message with its own data.
pub const ECHO: &str = "echo";
/// Broadcasts `{"tick": n}` every `interval_ms` of the initial data (100 by
/// default).
pub const TICKER: &str = "ticker";

pub fn builtin() -> PluginRegistry {
    PluginRegistry::new()
        .register(ECHO, echo)
        .register(TICKER, ticker)
}

async fn echo(options: FactoryOptions) -> anyhow::Result<()> {
    let protocol = options.negotiate_protocol(&[ProtocolIdentifier::EXPERIMENTAL])?;
    let mut messages = protocol.subscribe();
    while let Some(message) = messages.next().await {
        message.reply(message.data().clone());
    }
    Ok(())
}

async fn ticker(options: FactoryOptions) -> anyhow::Result<()> {
    let protocol = options.negotiate_protocol(&[ProtocolIdentifier::EXPERIMENTAL])?;
    let interval_ms = protocol.initial_data()["interval_ms"]
        .as_u64()
        .unwrap_or(100);

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    let mut tick = 0u64;
    loop {
        interval.tick().await;
        tick += 1;
        protocol.broadcast(json!({ "tick": tick }));
    }
}
