//! LinkPlay HTTP API client (WiiM streamers)
//!
//! Every operation is a GET of `/httpapi.asp?command=<cmd>` on the device.
//! Devices serve HTTPS with a self-signed certificate, so this client trusts
//! whatever certificate the device presents. That trust lives on this
//! client's own `reqwest::Client` and never leaks into other HTTP clients in
//! the process.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::adapters::linkplay_status::{parse_eq_list, PlayerStatus, Preset, PresetResponse};
use crate::config::HttpConfig;

const API_PATH: &str = "/httpapi.asp";

/// Failure taxonomy for device requests
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("No WiiM device configured")]
    NotConfigured,
    #[error("Invalid device URL: {0}")]
    InvalidRequest(String),
    #[error("Device returned error ({status_code})")]
    HttpStatus { status_code: u16 },
    #[error("Cannot reach device")]
    Unreachable,
    #[error("Device not responding")]
    Timeout,
    #[error("No network connection")]
    NoConnectivity,
    #[error("Invalid response: {0}")]
    Decode(String),
}

impl DeviceError {
    /// Classify a transport-level reqwest failure.
    fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        if let Some(kind) = io_error_kind(err) {
            match kind {
                std::io::ErrorKind::NetworkUnreachable | std::io::ErrorKind::NetworkDown => {
                    return Self::NoConnectivity;
                }
                std::io::ErrorKind::TimedOut => return Self::Timeout,
                _ => {}
            }
        }
        if err.is_builder() {
            return Self::InvalidRequest(err.to_string());
        }
        Self::Unreachable
    }
}

/// Walk the source chain looking for the underlying socket error
fn io_error_kind(err: &reqwest::Error) -> Option<std::io::ErrorKind> {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = e.source();
    }
    None
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scheme {
    #[default]
    Https,
    /// Plain HTTP, for bench rigs and mock devices
    Http,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Https => write!(f, "https"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Where the device API lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: Option<u16>,
    pub scheme: Scheme,
}

impl DeviceEndpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            scheme: Scheme::Https,
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    fn authority(&self) -> String {
        // Bare IPv6 literals need brackets inside a URL
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }

    /// Full request URL for a command.
    pub fn command_url(&self, command: &str) -> Result<Url, DeviceError> {
        if self.host.trim().is_empty() {
            return Err(DeviceError::NotConfigured);
        }
        // Keep the `:` argument separators readable; encode everything else
        let encoded = urlencoding::encode(command).replace("%3A", ":");
        let raw = format!(
            "{}://{}{}?command={}",
            self.scheme,
            self.authority(),
            API_PATH,
            encoded
        );
        Url::parse(&raw).map_err(|e| DeviceError::InvalidRequest(format!("{}: {}", raw, e)))
    }
}

/// Stateless command sender for one configured device
#[derive(Clone)]
pub struct LinkplayClient {
    endpoint: Arc<RwLock<Option<DeviceEndpoint>>>,
    http: Client,
}

impl LinkplayClient {
    pub fn new(http_config: &HttpConfig) -> Result<Self, DeviceError> {
        Self::with_timeouts(http_config.connect_timeout(), http_config.request_timeout())
    }

    pub fn with_timeouts(connect: Duration, overall: Duration) -> Result<Self, DeviceError> {
        let http = Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(connect)
            .timeout(overall)
            .build()
            .map_err(|e| DeviceError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            endpoint: Arc::new(RwLock::new(None)),
            http,
        })
    }

    /// Point the client at a device (or nowhere)
    pub async fn configure(&self, endpoint: Option<DeviceEndpoint>) {
        *self.endpoint.write().await = endpoint;
    }

    pub async fn endpoint(&self) -> Option<DeviceEndpoint> {
        self.endpoint.read().await.clone()
    }

    pub async fn is_configured(&self) -> bool {
        self.endpoint.read().await.is_some()
    }

    /// Issue a raw command and return the response body.
    pub async fn execute(&self, command: &str) -> Result<Vec<u8>, DeviceError> {
        let url = {
            let endpoint = self.endpoint.read().await;
            endpoint
                .as_ref()
                .ok_or(DeviceError::NotConfigured)?
                .command_url(command)?
        };

        debug!(command, "LinkPlay request");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| DeviceError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::HttpStatus {
                status_code: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DeviceError::from_transport(&e))?;

        debug!(command, bytes = body.len(), "LinkPlay response");
        Ok(body.to_vec())
    }

    async fn execute_ok(&self, command: &str) -> Result<(), DeviceError> {
        self.execute(command).await.map(|_| ())
    }

    pub async fn get_player_status(&self) -> Result<PlayerStatus, DeviceError> {
        let body = self.execute("getPlayerStatus").await?;
        serde_json::from_slice(&body).map_err(|e| DeviceError::Decode(e.to_string()))
    }

    pub async fn pause(&self) -> Result<(), DeviceError> {
        self.execute_ok("setPlayerCmd:pause").await
    }

    pub async fn resume(&self) -> Result<(), DeviceError> {
        self.execute_ok("setPlayerCmd:resume").await
    }

    /// Pause when playing, resume otherwise
    pub async fn toggle_play_pause(&self, is_playing: bool) -> Result<(), DeviceError> {
        if is_playing {
            self.pause().await
        } else {
            self.resume().await
        }
    }

    pub async fn next(&self) -> Result<(), DeviceError> {
        self.execute_ok("setPlayerCmd:next").await
    }

    pub async fn previous(&self) -> Result<(), DeviceError> {
        self.execute_ok("setPlayerCmd:prev").await
    }

    /// Set absolute volume. Input is clamped to [0,100].
    pub async fn set_volume(&self, level: i32) -> Result<(), DeviceError> {
        self.execute_ok(&volume_command(level)).await
    }

    pub async fn set_mute(&self, muted: bool) -> Result<(), DeviceError> {
        self.execute_ok(&format!("setPlayerCmd:mute:{}", u8::from(muted)))
            .await
    }

    pub async fn seek(&self, seconds: u32) -> Result<(), DeviceError> {
        self.execute_ok(&format!("setPlayerCmd:seek:{}", seconds))
            .await
    }

    pub async fn get_eq_list(&self) -> Result<Vec<String>, DeviceError> {
        let body = self.execute("EQGetList").await?;
        Ok(parse_eq_list(&body))
    }

    pub async fn load_eq_preset(&self, name: &str) -> Result<(), DeviceError> {
        self.execute_ok(&format!("EQLoad:{}", name)).await
    }

    pub async fn get_presets(&self) -> Result<Vec<Preset>, DeviceError> {
        let body = self.execute("getPresetInfo").await?;
        let response: PresetResponse =
            serde_json::from_slice(&body).map_err(|e| DeviceError::Decode(e.to_string()))?;
        Ok(response.preset_list.unwrap_or_default())
    }

    pub async fn play_preset(&self, number: u32) -> Result<(), DeviceError> {
        self.execute_ok(&format!("MCUKeyShortClick:{}", number))
            .await
    }
}

/// `setPlayerCmd:vol:N` with N clamped to [0,100]
pub fn volume_command(level: i32) -> String {
    format!("setPlayerCmd:vol:{}", clamp_volume(level))
}

pub fn clamp_volume(level: i32) -> u8 {
    level.clamp(0, 100) as u8
}
