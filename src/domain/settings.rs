use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
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
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
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
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_event_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Tunable timing and retry constants of the link, in milliseconds.
///
/// The defaults were tuned against real peripherals; only their rough
/// magnitude matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkTimings {
    pub connect_timeout_ms: u64,
    pub connect_retry_delay_ms: u64,
    pub max_connect_retries: u32,

    pub descriptor_write_timeout_ms: u64,
    pub descriptor_retry_delay_ms: u64,
    pub max_descriptor_retries: u32,

    pub verification_settle_ms: u64,
    pub probe_count: u32,
    pub probe_spacing_ms: u64,
    pub verification_timeout_ms: u64,
    pub max_verification_retries: u32,

    pub fragment_idle_timeout_ms: u64,
    pub duplicate_window_ms: u64,

    pub poll_interval_ms: u64,
    pub poll_retry_delay_ms: u64,
    pub poll_stall_timeout_ms: u64,

    pub preferred_mtu: u16,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            connect_retry_delay_ms: 1000,
            max_connect_retries: 3,

            descriptor_write_timeout_ms: 5000,
            descriptor_retry_delay_ms: 1000,
            max_descriptor_retries: 3,

            verification_settle_ms: 500,
            probe_count: 3,
            probe_spacing_ms: 200,
            verification_timeout_ms: 3000,
            max_verification_retries: 2,

            fragment_idle_timeout_ms: 100,
            duplicate_window_ms: 2000,

            poll_interval_ms: 50,
            poll_retry_delay_ms: 25,
            poll_stall_timeout_ms: 1000,

            preferred_mtu: 512,
        }
    }
}

impl LinkTimings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
    pub fn descriptor_write_timeout(&self) -> Duration {
        Duration::from_millis(self.descriptor_write_timeout_ms)
    }
    pub fn descriptor_retry_delay(&self) -> Duration {
        Duration::from_millis(self.descriptor_retry_delay_ms)
    }
    pub fn verification_settle(&self) -> Duration {
        Duration::from_millis(self.verification_settle_ms)
    }
    pub fn probe_spacing(&self) -> Duration {
        Duration::from_millis(self.probe_spacing_ms)
    }
    pub fn verification_timeout(&self) -> Duration {
        Duration::from_millis(self.verification_timeout_ms)
    }
    pub fn fragment_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.fragment_idle_timeout_ms)
    }
    pub fn duplicate_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn poll_retry_delay(&self) -> Duration {
        Duration::from_millis(self.poll_retry_delay_ms)
    }
    pub fn poll_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_stall_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Peripheral contract
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_event_uuid")]
    pub ble_event_char_uuid: String,
    #[serde(default = "default_device_names")]
    pub device_names: Vec<String>,

    // Connection behaviour
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default)]
    pub target_address: Option<String>,
    #[serde(default)]
    pub known_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,

    #[serde(default)]
    pub timings: LinkTimings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_event_char_uuid: default_event_uuid(),
            device_names: default_device_names(),
            auto_connect: true,
            target_address: None,
            known_addresses: Vec::new(),
            last_connected_address: None,
            timings: LinkTimings::default(),
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_event_uuid() -> String {
    protocol::EVENT_CHAR_UUID.to_string()
}
fn default_device_names() -> Vec<String> {
    protocol::KNOWN_DEVICE_NAMES
        .iter()
        .map(|name| name.to_string())
        .collect()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleEventLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
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

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Record a successful connection and persist it.
    pub fn remember_address(&mut self, address: &str) -> anyhow::Result<()> {
        if !self.settings.known_addresses.iter().any(|a| a == address) {
            self.settings.known_addresses.push(address.to_string());
        }
        self.settings.last_connected_address = Some(address.to_string());
        self.save()
    }
}
