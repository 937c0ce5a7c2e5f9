//! Media sources (WiiM streamer, local now-playing) and the pieces they share

pub mod linkplay;
pub mod linkplay_status;
pub mod local;
pub mod now_playing;
pub mod poller;
pub mod traits;
pub mod wiim;
pub mod wiim_discovery;

pub use traits::{
    Artwork, Capabilities, Capability, MediaSnapshot, MediaSource, SourceError, SourceState,
};
