use crate::settings::config::Settings;
use anyhow::{Context, Result};
use std::fs;
use std::ops::DerefMut;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Settings shared by the host and the worker contexts it starts. Each process
/// holds its own in-memory copy; saving makes changes visible to future runs.
#[derive(Clone)]
pub struct SettingsManager {
    settings_path: PathBuf,
    inner: Arc<Mutex<Settings>>,
}

impl SettingsManager {
    /// Create a new settings manager with default settings location
    pub fn new() -> Result<Self> {
        let settings_path = Self::default_settings_path()?;

        if let Some(parent) = settings_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {parent:?}"))?;
        }

        Self::from_path(settings_path)
    }

    /// Create a settings manager from a specific path
    pub fn from_path(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            Self::write_settings(&path, &Settings::default())?;
        }

        let loaded = Self::load_from_file_with_backup(&path)?;

        Ok(Self {
            settings_path: path,
            inner: Arc::new(Mutex::new(loaded)),
        })
    }

    /// Get the default settings path (~/.tether/settings.toml)
    fn default_settings_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".tether").join("settings.toml"))
    }

    /// Load settings from a TOML file, moving a corrupt file aside
    fn load_from_file_with_backup(path: &Path) -> Result<Settings> {
        if !path.exists() {
            return Ok(Settings::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {path:?}"))?;

        match toml::from_str(&contents) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!(?path, error = %e, "Settings file is corrupt, restoring defaults");
                let backup_path = path.with_extension("toml.backup");
                fs::rename(path, &backup_path).with_context(|| {
                    format!("Failed to backup corrupted settings to {backup_path:?}")
                })?;

                let default_settings = Settings::default();
                Self::write_settings(path, &default_settings)?;
                Ok(default_settings)
            }
        }
    }

    fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {parent:?}"))?;
        }
        let contents = toml::to_string_pretty(settings).context("Failed to serialize settings")?;
        fs::write(path, contents).with_context(|| format!("Failed to write settings to {path:?}"))
    }

    /// Get the in-memory settings
    pub fn settings(&self) -> Settings {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Update in-memory settings with a closure. Note: settings are not saved to disk
    pub fn update_setting<F>(&self, updater: F)
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        updater(guard.deref_mut());
    }

    /// Save provided settings
    pub fn save_settings(&self, settings: Settings) -> Result<()> {
        Self::write_settings(&self.settings_path, &settings)?;
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = settings;
        Ok(())
    }

    /// Explicitly persist in-memory settings to disk
    pub fn save(&self) -> Result<()> {
        self.save_settings(self.settings())
    }

    /// Get the settings file path
    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn shared_workers_enabled(&self) -> bool {
        self.settings().experiments.shared_workers
    }
}
