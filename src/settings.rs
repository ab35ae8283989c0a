//! User settings persisted between runs
//!
//! Stored as pretty-printed JSON. Loading never fails: a missing or corrupt
//! file yields defaults so the streamer always starts.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::constants::DEFAULT_VOLUME;
use crate::error::ConfigError;

/// A receiver the user has seen and its enable flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedDevice {
    pub id: String,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub global_volume: u8,
    pub saved_devices: Vec<SavedDevice>,
    pub auto_start_streaming: bool,
    pub preferred_audio_device: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            global_volume: DEFAULT_VOLUME,
            saved_devices: Vec::new(),
            auto_start_streaming: false,
            preferred_audio_device: String::new(),
        }
    }
}

/// File-backed settings
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `settings.json` in the per-user data directory
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        directories::ProjectDirs::from("", "", "airplay-streamer")
            .map(|dirs| dirs.data_dir().join("settings.json"))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Settings {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings at {}, using defaults", self.path.display());
                return Settings::default();
            }
            Err(e) => {
                warn!("Failed to read settings {}: {}", self.path.display(), e);
                return Settings::default();
            }
        };

        match serde_json::from_str::<Settings>(&text) {
            Ok(mut settings) => {
                settings.global_volume = settings.global_volume.min(100);
                info!("Settings loaded from {}", self.path.display());
                settings
            }
            Err(e) => {
                warn!("Failed to parse settings {}: {}", self.path.display(), e);
                Settings::default()
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ConfigError::Serialize(e.to_string()))?;
            }
        }
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        fs::write(&self.path, json).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        Ok(())
    }
}
