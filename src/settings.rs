// src/settings.rs
//
// Persisted link settings: the last chosen device path and baud rate.
// Stored as JSON in the per-user config directory, shared with other RoboGo
// tools, so keys this crate does not know about are kept on save.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::io::serial::DEFAULT_BAUD_RATE;

const CONFIG_DIR_NAME: &str = "RoboGo";
const CONFIG_FILE_NAME: &str = "robogo-config.json";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    #[serde(default)]
    pub serial_port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Keys written by other tools
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            serial_port: None,
            baud_rate: default_baud_rate(),
            other: serde_json::Map::new(),
        }
    }
}

/// Location of the config file. The directory is not created here.
pub fn settings_path() -> Result<PathBuf, String> {
    let config_dir =
        dirs::config_dir().ok_or_else(|| "Failed to get user config dir".to_string())?;
    Ok(config_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

pub fn load_settings() -> Result<BridgeSettings, String> {
    load_settings_from(&settings_path()?)
}

pub fn save_settings(settings: &BridgeSettings) -> Result<(), String> {
    save_settings_to(&settings_path()?, settings)
}

pub fn reset_settings() -> Result<bool, String> {
    reset_settings_at(&settings_path()?)
}

/// Missing or unparseable files yield defaults.
pub fn load_settings_from(path: &Path) -> Result<BridgeSettings, String> {
    if !path.exists() {
        return Ok(BridgeSettings::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read settings: {}", e))?;

    match serde_json::from_str(&content) {
        Ok(settings) => Ok(settings),
        Err(e) => {
            tlog!(
                "[settings] Ignoring unreadable config at {:?}, using defaults: {}",
                path,
                e
            );
            Ok(BridgeSettings::default())
        }
    }
}

pub fn save_settings_to(path: &Path, settings: &BridgeSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config dir: {}", e))?;
    }

    let content = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;

    std::fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))?;
    tlog!("[settings] Saved settings to {:?}", path);
    Ok(())
}

/// Delete the config file. Returns whether there was one.
pub fn reset_settings_at(path: &Path) -> Result<bool, String> {
    if !path.exists() {
        return Ok(false);
    }
    std::fs::remove_file(path).map_err(|e| format!("Failed to remove settings: {}", e))?;
    tlog!("[settings] Removed {:?}", path);
    Ok(true)
}
