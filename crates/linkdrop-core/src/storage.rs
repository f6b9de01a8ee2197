//! Storage layer for persistent data (settings only - rules live for a session)

use crate::error::LinkdropError;
use linkdrop_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

const SETTINGS_FILE: &str = "settings.json";

/// Storage manager for Linkdrop data
#[derive(Clone, Debug)]
pub struct Storage {
    /// Data directory
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance
    pub async fn new(data_dir: PathBuf) -> Result<Self, LinkdropError> {
        fs::create_dir_all(&data_dir).await?;

        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Load settings, falling back to defaults when the file is missing or unreadable
    pub async fn load_settings(&self) -> Settings {
        let path = self.settings_path();
        if !path.exists() {
            return Settings::default();
        }

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read settings from {}: {}", path.display(), e);
                return Settings::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Ignoring invalid settings file {}: {}", path.display(), e);
                Settings::default()
            }
        }
    }

    /// Save settings to storage
    pub async fn save_settings(&self, settings: &Settings) -> Result<(), LinkdropError> {
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| LinkdropError::Serialization(e.to_string()))?;

        fs::write(self.settings_path(), content).await?;

        Ok(())
    }
}
