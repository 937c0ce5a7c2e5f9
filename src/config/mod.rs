//! Configuration management
//!
//! Two layers:
//! - [`Config`]: static tuning loaded through the `config` crate
//!   (defaults → `config.*` file → `WIIM_*` environment variables)
//! - [`Settings`]: the user's device selection and arbitration mode,
//!   written back whenever they change (`settings.json`)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus::ArbitrationMode;

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Poll period for both sources
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a discovery session browses before stopping on its own
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,

    #[serde(default)]
    pub http: HttpConfig,

    /// Static device override; takes precedence over the saved selection
    #[serde(default)]
    pub device: Option<DeviceConfig>,
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            discovery_timeout_secs: default_discovery_timeout_secs(),
            http: HttpConfig::default(),
            device: None,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_discovery_timeout_secs() -> u64 {
    10
}

/// Device API timeouts. Connect and overall completion are bounded separately.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Get config directory (platform default unless WIIM_CONFIG_DIR is set)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("WIIM_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/wiim-control");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("wiim-control");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config/wiim-control");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("wiim-control");
        }
    }

    // Fallback to current directory
    PathBuf::from(".")
}

/// Path of the persisted settings file
pub fn get_settings_path() -> PathBuf {
    get_config_dir().join(SETTINGS_FILE)
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("poll_interval_ms", default_poll_interval_ms())?
        .set_default("discovery_timeout_secs", default_discovery_timeout_secs())?
        // Load from config file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // WIIM_POLL_INTERVAL_MS, WIIM_HTTP__CONNECT_TIMEOUT_SECS, ...
        .add_source(
            ::config::Environment::with_prefix("WIIM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // Short-form device override: WIIM_HOST / WIIM_PORT
    if let Ok(host) = std::env::var("WIIM_HOST") {
        builder = builder.set_override("device.host", host)?;
    }
    if let Ok(port) = std::env::var("WIIM_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("device.port", port_num as i64)?;
        }
    }

    let config: Config = builder.build()?.try_deserialize()?;
    if config.poll_interval_ms == 0 {
        anyhow::bail!("poll_interval_ms must be greater than 0");
    }

    Ok(config)
}

// =============================================================================
// Persisted settings
// =============================================================================

/// Device selection as persisted. The API always lives on the device's
/// HTTPS port, so only a non-standard port is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedDevice {
    pub host: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<SavedDevice>,
    #[serde(default)]
    pub mode: ArbitrationMode,
}

/// Durable key-value home for [`Settings`]
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Settings;
    fn save(&self, settings: &Settings);

    /// Read-modify-write helper
    fn update(&self, f: &dyn Fn(&mut Settings)) {
        let mut settings = self.load();
        f(&mut settings);
        self.save(&settings);
    }
}

pub type SharedSettings = Arc<dyn SettingsStore>;

/// Settings persisted as pretty JSON on disk
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default location inside the config directory
    pub fn default_location() -> Self {
        Self::new(get_settings_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Settings {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return Settings::default(),
        };
        match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Failed to parse settings {}: {}", self.path.display(), e);
                Settings::default()
            }
        }
    }

    fn save(&self, settings: &Settings) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("Failed to create config directory: {}", e);
                return;
            }
        }
        match serde_json::to_string_pretty(settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    tracing::error!("Failed to save settings: {}", e);
                } else {
                    tracing::debug!("Saved settings to {}", self.path.display());
                }
            }
            Err(e) => tracing::error!("Failed to serialize settings: {}", e),
        }
    }
}

/// Non-durable store, for tests and ephemeral runs
#[derive(Default)]
pub struct MemorySettingsStore {
    inner: Mutex<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Mutex::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Settings {
        self.inner
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn save(&self, settings: &Settings) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = settings.clone();
        }
    }
}
