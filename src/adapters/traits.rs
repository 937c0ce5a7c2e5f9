use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::adapters::linkplay::DeviceError;
use crate::adapters::linkplay_status::{Preset, DEFAULT_VOLUME};
use crate::adapters::now_playing::BridgeError;
use crate::bus::{SourceId, SourceKind};

// =============================================================================
// Capabilities
// =============================================================================

/// Named operation a source variant supports. Used in error messages and
/// for single-capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    PlayPause,
    Next,
    Previous,
    Seek,
    Volume,
    Presets,
    Equalizer,
}

impl Capability {
    fn bit(self) -> u8 {
        match self {
            Self::PlayPause => 1 << 0,
            Self::Next => 1 << 1,
            Self::Previous => 1 << 2,
            Self::Seek => 1 << 3,
            Self::Volume => 1 << 4,
            Self::Presets => 1 << 5,
            Self::Equalizer => 1 << 6,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PlayPause => "play/pause",
            Self::Next => "next",
            Self::Previous => "previous",
            Self::Seek => "seek",
            Self::Volume => "volume",
            Self::Presets => "presets",
            Self::Equalizer => "equalizer",
        };
        write!(f, "{}", name)
    }
}

/// Capability bitset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Self = Self(0);
    pub const PLAY_PAUSE: Self = Self(1 << 0);
    pub const NEXT: Self = Self(1 << 1);
    pub const PREVIOUS: Self = Self(1 << 2);
    pub const SEEK: Self = Self(1 << 3);
    pub const VOLUME: Self = Self(1 << 4);
    pub const PRESETS: Self = Self(1 << 5);
    pub const EQUALIZER: Self = Self(1 << 6);

    /// Everything the streamer can do
    pub const REMOTE: Self = Self(0b0111_1111);
    /// OS now-playing sessions have no seek, presets or EQ
    pub const LOCAL: Self =
        Self(Self::PLAY_PAUSE.0 | Self::NEXT.0 | Self::PREVIOUS.0 | Self::VOLUME.0);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn supports(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

// =============================================================================
// Source state
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artwork {
    Url(Url),
    Data(Vec<u8>),
}

/// Last-fetched playback state. Replaced wholesale on every successful poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaSnapshot {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub artwork: Option<Artwork>,
    pub playing: bool,
    pub position: Duration,
    pub duration: Duration,
}

impl MediaSnapshot {
    pub fn has_metadata(&self) -> bool {
        !self.title.is_empty() || !self.artist.is_empty()
    }
}

/// Remote-only extras
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteExtras {
    pub presets: Vec<Preset>,
    pub eq_presets: Vec<String>,
    /// Last EQ preset this session loaded successfully
    pub current_eq: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceExtras {
    /// 0-100
    pub volume: u8,
    pub muted: bool,
    pub remote: Option<RemoteExtras>,
}

impl Default for SourceExtras {
    fn default() -> Self {
        Self {
            volume: DEFAULT_VOLUME,
            muted: false,
            remote: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceState {
    pub identifier: SourceId,
    pub capabilities: Capabilities,
    pub available: bool,
    pub snapshot: MediaSnapshot,
    pub extras: SourceExtras,
}

impl SourceState {
    pub fn new(identifier: SourceId, capabilities: Capabilities) -> Self {
        let remote = match identifier.kind() {
            SourceKind::Remote => Some(RemoteExtras::default()),
            SourceKind::Local => None,
        };
        Self {
            identifier,
            capabilities,
            available: false,
            snapshot: MediaSnapshot::default(),
            extras: SourceExtras {
                remote,
                ..SourceExtras::default()
            },
        }
    }

    pub fn is_playing(&self) -> bool {
        self.snapshot.playing
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

// =============================================================================
// MediaSource
// =============================================================================

/// Capability-tagged media backend.
///
/// Sources never check whether they are the active one; the arbitrator gates
/// capabilities before routing a command. Change notification goes through
/// the event bus (`SourceChanged` / `TrackChanged`).
#[async_trait]
pub trait MediaSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn capabilities(&self) -> Capabilities;

    async fn identifier(&self) -> SourceId;

    async fn is_available(&self) -> bool;

    async fn snapshot(&self) -> MediaSnapshot;

    /// Full copy of the current state
    async fn state(&self) -> SourceState;

    /// Start polling. No-op if already running.
    async fn start_monitoring(&self);

    /// Stop polling. Safe to call repeatedly or before start.
    async fn stop_monitoring(&self);

    async fn toggle_play_pause(&self) -> Result<(), SourceError>;

    async fn next(&self) -> Result<(), SourceError>;

    async fn previous(&self) -> Result<(), SourceError>;

    async fn seek(&self, seconds: u32) -> Result<(), SourceError>;

    /// Volume 0-100; out-of-range values are clamped
    async fn set_volume(&self, level: i32) -> Result<(), SourceError>;

    async fn set_mute(&self, muted: bool) -> Result<(), SourceError>;
}
