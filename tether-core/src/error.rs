use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ProtocolIdentifier;

/// Version reported in compatibility errors.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug)]
pub enum SharedWorkerError {
    #[error("Shared workers are experimental. Opt in to them in your tether settings")]
    NotEnabled,

    #[error("Shared workers are not supported: {0}")]
    Unsupported(String),

    #[error("This version of tether ({version}) does not support any of desired shared worker protocols: {}", join(.requested))]
    UnsupportedProtocols {
        version: &'static str,
        requested: Vec<ProtocolIdentifier>,
    },

    #[error("This version of tether ({version}) is not compatible with shared worker plugin at {}", .filename.display())]
    IncompatiblePlugin {
        version: &'static str,
        filename: PathBuf,
    },

    #[error("Shared worker plugin at {} finished without negotiating a protocol", .0.display())]
    NotNegotiated(PathBuf),

    #[error("Failed to load shared worker plugin at {}: {reason:#}", .filename.display())]
    Load {
        filename: PathBuf,
        reason: anyhow::Error,
    },

    #[error("Shared worker plugin failed: {0:#}")]
    Plugin(anyhow::Error),

    #[error("Shared worker is not yet available")]
    NotAvailable,

    #[error("The shared worker is no longer available")]
    Unavailable,

    #[error("Shared worker transport closed: {0}")]
    Transport(String),
}

fn join(identifiers: &[ProtocolIdentifier]) -> String {
    identifiers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Structured error record that can cross a thread or process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub chain: Vec<String>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            chain: vec![],
        }
    }

    pub fn from_anyhow(name: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            name: name.into(),
            message: error.to_string(),
            chain: error.chain().skip(1).map(ToString::to_string).collect(),
        }
    }

    pub fn from_error(name: impl Into<String>, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = vec![];
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        Self {
            name: name.into(),
            message: error.to_string(),
            chain,
        }
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        for cause in &self.chain {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}
