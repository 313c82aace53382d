use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Opt-in switches for features whose interface may still change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiments {
    /// Must be enabled before any worker context may register a shared worker.
    #[serde(default)]
    pub shared_workers: bool,
}

/// How the host starts a shared worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LaunchMode {
    /// A dedicated OS thread inside the host process.
    #[default]
    Thread,
    /// A child process speaking JSON lines over stdin/stdout, such as the
    /// `tether-subprocess` binary.
    Process {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedWorkerSettings {
    #[serde(default)]
    pub launch: LaunchMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub experiments: Experiments,

    #[serde(default)]
    pub shared_workers: SharedWorkerSettings,
}

impl Settings {
    /// Settings with the shared worker experiment switched on.
    pub fn with_shared_workers() -> Self {
        Self {
            experiments: Experiments {
                shared_workers: true,
            },
            ..Default::default()
        }
    }
}
