//! OS now-playing bridge and system volume seams
//!
//! The local source talks to the operating system through these traits only.
//! Platform bridges plug in behind them; the shipped binary uses
//! [`UnsupportedBridge`] and [`UnsupportedVolume`], which report no media.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Now-playing bridge not supported on this platform")]
    Unsupported,
    #[error("Now-playing bridge failed: {0}")]
    Failed(String),
}

/// Media info as reported by the OS session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NowPlayingInfo {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub artwork: Option<Vec<u8>>,
    pub duration: Option<Duration>,
    pub elapsed: Option<Duration>,
    /// 0.0 when paused
    pub playback_rate: f64,
}

impl NowPlayingInfo {
    pub fn is_playing(&self) -> bool {
        self.playback_rate > 0.0
    }
}

/// Application owning the now-playing session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NowPlayingApp {
    pub bundle_id: Option<String>,
    pub icon: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Play,
    Pause,
    TogglePlayPause,
    Stop,
    NextTrack,
    PreviousTrack,
}

/// Change hints pushed by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NowPlayingNotification {
    InfoChanged,
    ApplicationChanged,
    PlaybackStateChanged,
}

#[async_trait]
pub trait NowPlayingBridge: Send + Sync {
    /// Begin change notifications. `None` when the bridge cannot push.
    fn register_for_notifications(&self) -> Option<broadcast::Receiver<NowPlayingNotification>>;

    fn unregister_for_notifications(&self);

    async fn now_playing_info(&self) -> Result<Option<NowPlayingInfo>, BridgeError>;

    async fn now_playing_app(&self) -> Result<Option<NowPlayingApp>, BridgeError>;

    async fn send_command(&self, command: TransportCommand) -> Result<(), BridgeError>;
}

/// OS output volume, 0-100
#[async_trait]
pub trait SystemVolume: Send + Sync {
    async fn volume(&self) -> Result<u8, BridgeError>;
    async fn set_volume(&self, level: u8) -> Result<(), BridgeError>;
    async fn is_muted(&self) -> Result<bool, BridgeError>;
    async fn set_muted(&self, muted: bool) -> Result<(), BridgeError>;
}

/// Answer from a player queried outside the bridge
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackTrack {
    pub bundle_id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub playing: bool,
    pub duration: Duration,
    pub position: Duration,
}

/// Secondary path for players the bridge misses
#[async_trait]
pub trait FallbackPlayerQuery: Send + Sync {
    async fn query(&self) -> Option<FallbackTrack>;
}

// =============================================================================
// Shipped implementations
// =============================================================================

/// Bridge for platforms without a now-playing API
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBridge;

#[async_trait]
impl NowPlayingBridge for UnsupportedBridge {
    fn register_for_notifications(&self) -> Option<broadcast::Receiver<NowPlayingNotification>> {
        None
    }

    fn unregister_for_notifications(&self) {}

    async fn now_playing_info(&self) -> Result<Option<NowPlayingInfo>, BridgeError> {
        Ok(None)
    }

    async fn now_playing_app(&self) -> Result<Option<NowPlayingApp>, BridgeError> {
        Ok(None)
    }

    async fn send_command(&self, _command: TransportCommand) -> Result<(), BridgeError> {
        Err(BridgeError::Unsupported)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedVolume;

#[async_trait]
impl SystemVolume for UnsupportedVolume {
    async fn volume(&self) -> Result<u8, BridgeError> {
        Err(BridgeError::Unsupported)
    }

    async fn set_volume(&self, _level: u8) -> Result<(), BridgeError> {
        Err(BridgeError::Unsupported)
    }

    async fn is_muted(&self) -> Result<bool, BridgeError> {
        Err(BridgeError::Unsupported)
    }

    async fn set_muted(&self, _muted: bool) -> Result<(), BridgeError> {
        Err(BridgeError::Unsupported)
    }
}

const SPOTIFY_BUNDLE_ID: &str = "com.spotify.client";
const FIELD_SEPARATOR: &str = "|||";

const SPOTIFY_SCRIPT: &str = r#"if application "Spotify" is running then
tell application "Spotify"
set t to current track
return (name of t) & "|||" & (artist of t) & "|||" & (album of t) & "|||" & (player state as string) & "|||" & (duration of t) & "|||" & (player position)
end tell
end if"#;

/// Asks Spotify directly through `osascript`. Only meaningful on macOS;
/// elsewhere the process spawn fails and the query yields nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpotifyScriptQuery;

#[async_trait]
impl FallbackPlayerQuery for SpotifyScriptQuery {
    async fn query(&self) -> Option<FallbackTrack> {
        let output = tokio::process::Command::new("osascript")
            .arg("-e")
            .arg(SPOTIFY_SCRIPT)
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                parse_spotify_output(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                debug!("Spotify query exited with {}", out.status);
                None
            }
            Err(e) => {
                debug!("Spotify query unavailable: {}", e);
                None
            }
        }
    }
}

/// Parse `name|||artist|||album|||state|||duration_ms|||position_s`
pub fn parse_spotify_output(raw: &str) -> Option<FallbackTrack> {
    let parts: Vec<&str> = raw.trim().split(FIELD_SEPARATOR).collect();
    if parts.len() < 4 {
        return None;
    }

    let title = parts[0].trim().to_string();
    let artist = parts[1].trim().to_string();
    if title.is_empty() && artist.is_empty() {
        return None;
    }

    let seconds = |idx: usize, scale: f64| {
        parts
            .get(idx)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
            .map(|v| Duration::from_secs_f64(v / scale))
            .unwrap_or_default()
    };

    Some(FallbackTrack {
        bundle_id: SPOTIFY_BUNDLE_ID.to_string(),
        title,
        artist,
        album: parts[2].trim().to_string(),
        playing: parts[3].trim() == "playing",
        duration: seconds(4, 1000.0),
        position: seconds(5, 1.0),
    })
}
