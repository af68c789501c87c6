//! Central configuration.

#[cfg(feature = "fs")]
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
#[cfg(feature = "fs")]
use tracing::{debug, warn};

use crate::{InitOptions, ScanOptions};

/// Options applied when a [`crate::Central`] is created.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Config {
    /// Ask the user to power on the radio if it is off.
    pub show_power_alert: bool,
    /// Identifier used by the platform to restore the adapter state.
    pub restore_id: Option<String>,
    /// Report every advertisement by default instead of one per device.
    pub allow_duplicates: bool,
}

impl Config {
    #[cfg(feature = "fs")]
    const FILE_NAME: &'static str = "central.json";

    /// Parses a JSON configuration.
    #[cfg(feature = "fs")]
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Loads the configuration from `path`. The default configuration is
    /// returned if the file does not exist or is invalid.
    #[cfg(feature = "fs")]
    #[must_use]
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let s = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Config file {} not found", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!("Failed to read config file {}: {e}", path.display());
                return Self::default();
            }
        };
        Self::from_json(&s).unwrap_or_else(|e| {
            warn!("Invalid config file {}: {e}", path.display());
            Self::default()
        })
    }

    /// Saves the configuration to `path`, creating parent directories as
    /// needed. Returns whether the operation was successful.
    #[cfg(feature = "fs")]
    pub fn save(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let s = match serde_json::to_string_pretty(self) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize config: {e}");
                return false;
            }
        };
        if let Some(dir) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Failed to create config directory {}: {e}", dir.display());
                return false;
            }
        }
        if let Err(e) = std::fs::write(path, s) {
            warn!("Failed to write config file {}: {e}", path.display());
            return false;
        }
        debug!("Saved config to {}", path.display());
        true
    }

    /// Returns the configuration file path of application `app` in the current
    /// user's config directory or [`None`] if the directory cannot be
    /// determined.
    #[cfg(feature = "fs")]
    #[must_use]
    pub fn per_user(app: impl AsRef<Path>) -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(app.as_ref()).join(Self::FILE_NAME))
    }

    /// Returns the adapter-level options.
    #[must_use]
    pub fn init_options(&self) -> InitOptions {
        InitOptions {
            show_power_alert: self.show_power_alert,
            restore_id: self.restore_id.clone(),
        }
    }

    /// Returns the default scan options.
    #[inline]
    #[must_use]
    pub fn scan_options(&self) -> ScanOptions {
        if self.allow_duplicates {
            ScanOptions::ALLOW_DUPLICATES
        } else {
            ScanOptions::empty()
        }
    }
}
