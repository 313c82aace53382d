pub mod config;
pub mod manager;


pub use config::{Experiments, LaunchMode, Settings, SharedWorkerSettings};
pub use manager::SettingsManager;
