//! Event types for the source arbitration bus.
//!
//! Sources, discovery and the arbitrator never call each other for
//! notifications; they publish one of these events and whoever cares
//! subscribes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::adapters::wiim_discovery::Device;

// =============================================================================
// Source identity
// =============================================================================

/// Which of the two backends a value refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// The network streamer
    Remote,
    /// Whatever the OS reports as the now-playing application
    Local,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Identity of the thing currently behind a source.
///
/// The remote side is named after the configured device; the local side is
/// named after the application driving the OS now-playing session and changes
/// whenever that application changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceId {
    Remote { device_name: String },
    Local { bundle_id: String, app: LocalApp },
}

impl SourceId {
    pub fn remote(device_name: impl Into<String>) -> Self {
        Self::Remote {
            device_name: device_name.into(),
        }
    }

    /// Build a local identifier, classifying the bundle id.
    /// `title` lets browser playback of YouTube be told apart from other tabs.
    pub fn local(bundle_id: Option<&str>, title: Option<&str>) -> Self {
        let bundle_id = bundle_id.unwrap_or(UNKNOWN_BUNDLE_ID);
        Self::Local {
            bundle_id: bundle_id.to_string(),
            app: LocalApp::classify(bundle_id, title),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Remote { .. } => SourceKind::Remote,
            Self::Local { .. } => SourceKind::Local,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Self::Remote { device_name } if device_name.is_empty() => "WiiM".to_string(),
            Self::Remote { device_name } => device_name.clone(),
            Self::Local { app, .. } => app.display_name(),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.display_name())
    }
}

pub const UNKNOWN_BUNDLE_ID: &str = "unknown";

/// Known local players, derived from the now-playing bundle identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "app", content = "name", rename_all = "snake_case")]
pub enum LocalApp {
    Spotify,
    AppleMusic,
    AmazonMusic,
    Plexamp,
    YouTube,
    Browser(String),
    Unknown(String),
}

impl LocalApp {
    pub fn classify(bundle_id: &str, title: Option<&str>) -> Self {
        let is_youtube = title.is_some_and(|t| t.to_lowercase().contains("youtube"));
        let lower = bundle_id.to_lowercase();

        match bundle_id {
            "com.spotify.client" => Self::Spotify,
            "com.apple.Music" => Self::AppleMusic,
            "com.amazon.music" => Self::AmazonMusic,
            "tv.plex.plexamp" => Self::Plexamp,
            _ => {
                let browser = if lower.contains("safari") {
                    Some("Safari")
                } else if lower.contains("chrome") {
                    Some("Chrome")
                } else if lower.contains("firefox") {
                    Some("Firefox")
                } else {
                    None
                };
                match browser {
                    Some(_) if is_youtube => Self::YouTube,
                    Some(name) => Self::Browser(name.to_string()),
                    None => Self::Unknown(bundle_id.to_string()),
                }
            }
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Self::Spotify => "Spotify".to_string(),
            Self::AppleMusic => "Apple Music".to_string(),
            Self::AmazonMusic => "Amazon Music".to_string(),
            Self::Plexamp => "Plex Amp".to_string(),
            Self::YouTube => "YouTube".to_string(),
            Self::Browser(name) => name.clone(),
            // Last reverse-DNS component: "org.videolan.vlc" -> "vlc"
            Self::Unknown(bundle_id) => bundle_id
                .rsplit('.')
                .next()
                .unwrap_or(bundle_id)
                .to_string(),
        }
    }
}

// =============================================================================
// Arbitration mode
// =============================================================================

/// User preference for which source receives commands.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationMode {
    #[default]
    Automatic,
    ForceRemote,
    ForceLocal,
}

impl ArbitrationMode {
    pub const ALL: [ArbitrationMode; 3] = [Self::Automatic, Self::ForceRemote, Self::ForceLocal];

    pub fn description(&self) -> &'static str {
        match self {
            Self::Automatic => "Automatically switch based on what's playing",
            Self::ForceRemote => "Always control the WiiM device",
            Self::ForceLocal => "Always control local media apps",
        }
    }
}

impl fmt::Display for ArbitrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Automatic => write!(f, "auto"),
            Self::ForceRemote => write!(f, "remote"),
            Self::ForceLocal => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for ArbitrationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "automatic" => Ok(Self::Automatic),
            "remote" | "wiim" | "force_remote" => Ok(Self::ForceRemote),
            "local" | "force_local" => Ok(Self::ForceLocal),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

// =============================================================================
// Bus Events
// =============================================================================

/// All events that can be published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BusEvent {
    // =========================================================================
    // Source Events
    // =========================================================================
    /// A source's observable state changed (track, artist, playing flag,
    /// identity or availability). Published at most once per poll cycle.
    SourceChanged { source: SourceKind },

    /// A source moved to a new title. Enrichment collaborators (artwork,
    /// catalog lookups) key off this instead of every poll.
    TrackChanged {
        source: SourceKind,
        title: String,
        artist: String,
        album: String,
    },

    // =========================================================================
    // Arbitration Events
    // =========================================================================
    /// The arbitrator selected a different source
    ActiveSourceChanged {
        previous: Option<SourceId>,
        current: SourceId,
    },

    /// The user changed the arbitration mode
    ModeChanged { mode: ArbitrationMode },

    // =========================================================================
    // Discovery Events
    // =========================================================================
    /// A new device resolved during discovery
    DeviceDiscovered { device: Device },

    /// A discovery session ended (timeout or explicit stop)
    DiscoveryFinished { device_count: usize },

    /// The remote source was pointed at a device
    DeviceConfigured { device: Device },

    // =========================================================================
    // System Events
    // =========================================================================
    /// System is shutting down
    ShuttingDown {
        /// Reason for shutdown
        reason: Option<String>,
    },
}

impl BusEvent {
    /// Get the event type as a string (for logging/filtering)
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SourceChanged { .. } => "source_changed",
            Self::TrackChanged { .. } => "track_changed",
            Self::ActiveSourceChanged { .. } => "active_source_changed",
            Self::ModeChanged { .. } => "mode_changed",
            Self::DeviceDiscovered { .. } => "device_discovered",
            Self::DiscoveryFinished { .. } => "discovery_finished",
            Self::DeviceConfigured { .. } => "device_configured",
            Self::ShuttingDown { .. } => "shutting_down",
        }
    }

    /// Events the arbitrator must react to
    pub fn affects_arbitration(&self) -> bool {
        matches!(
            self,
            Self::SourceChanged { .. } | Self::ModeChanged { .. } | Self::DeviceConfigured { .. }
        )
    }
}
