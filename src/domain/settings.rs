//! Persisted daemon settings.
//!
//! Stored as pretty JSON under the platform config directory. Every field
//! carries a serde default so old settings files keep loading after new
//! fields are added.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "blebridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Discovery lifecycle
    //
    // The client protocol expects one-shot discovery while the platform
    // scans until told to stop, so every session is capped by this timer.
    // 120 seconds covers one inquiry scan plus page scans for ~100 new
    // devices.
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,

    // Device chooser
    #[serde(default = "default_chooser_scan_secs")]
    pub chooser_scan_duration_secs: u64,
    #[serde(default = "default_rssi_floor")]
    pub rssi_floor: i16,
    #[serde(default = "default_rssi_ceiling")]
    pub rssi_ceiling: i16,

    // GATT server
    #[serde(default = "default_max_advertisements")]
    pub max_advertisements: usize,

    // Extra blocklist lines in "uuid [exclude-reads|exclude-writes]" form,
    // appended to the built-in blocklist.
    #[serde(default)]
    pub extra_blocklist: Vec<String>,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: default_discovery_timeout_secs(),
            chooser_scan_duration_secs: default_chooser_scan_secs(),
            rssi_floor: default_rssi_floor(),
            rssi_ceiling: default_rssi_ceiling(),
            max_advertisements: default_max_advertisements(),
            extra_blocklist: Vec::new(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_discovery_timeout_secs() -> u64 {
    120
}
fn default_chooser_scan_secs() -> u64 {
    60
}
fn default_rssi_floor() -> i16 {
    -100
}
fn default_rssi_ceiling() -> i16 {
    -55
}
fn default_max_advertisements() -> usize {
    16
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleBridge");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
