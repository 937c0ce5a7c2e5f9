//! Local media source: whatever the OS reports as now playing
//!
//! Reads go through a [`NowPlayingBridge`], volume through [`SystemVolume`].
//! Besides the poll timer, bridge change notifications trigger an immediate
//! refresh while monitoring.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapters::linkplay::clamp_volume;
use crate::adapters::now_playing::{
    FallbackPlayerQuery, NowPlayingBridge, NowPlayingInfo, SystemVolume, TransportCommand,
};
use crate::adapters::poller::{Fetched, PollingSynchronizer, StatusFetch};
use crate::adapters::traits::{
    Artwork, Capabilities, MediaSnapshot, MediaSource, SourceError, SourceState,
};
use crate::bus::{SharedBus, SourceId, SourceKind};

const TOGGLE_SETTLE: Duration = Duration::from_millis(100);
const TRACK_SETTLE: Duration = Duration::from_millis(300);

/// Poll half of the local source
pub struct NowPlayingFetch {
    bridge: Arc<dyn NowPlayingBridge>,
    fallback: Option<Arc<dyn FallbackPlayerQuery>>,
}

impl NowPlayingFetch {
    async fn fetch_fallback(&self) -> Option<Fetched> {
        let track = self.fallback.as_ref()?.query().await?;
        let identifier = SourceId::local(Some(&track.bundle_id), Some(&track.title));
        let snapshot = MediaSnapshot {
            title: track.title,
            artist: track.artist,
            album: track.album,
            artwork: None,
            playing: track.playing,
            position: track.position,
            duration: track.duration,
        };
        Some(Fetched {
            identifier,
            available: snapshot.has_metadata(),
            snapshot,
            volume: None,
        })
    }
}

#[async_trait]
impl StatusFetch for NowPlayingFetch {
    async fn fetch(&self) -> Result<Fetched, SourceError> {
        let info = match self.bridge.now_playing_info().await? {
            Some(info) => info,
            None => {
                if let Some(fetched) = self.fetch_fallback().await {
                    return Ok(fetched);
                }
                NowPlayingInfo::default()
            }
        };

        let app = self.bridge.now_playing_app().await?;
        let title = info.title.unwrap_or_default();
        let identifier = SourceId::local(
            app.as_ref().and_then(|a| a.bundle_id.as_deref()),
            Some(&title),
        );

        let snapshot = MediaSnapshot {
            title,
            artist: info.artist.unwrap_or_default(),
            album: info.album.unwrap_or_default(),
            artwork: info.artwork.map(Artwork::Data),
            playing: info.playback_rate > 0.0,
            position: info.elapsed.unwrap_or_default(),
            duration: info.duration.unwrap_or_default(),
        };

        Ok(Fetched {
            identifier,
            available: snapshot.has_metadata(),
            snapshot,
            volume: None,
        })
    }
}

pub struct LocalSource {
    bridge: Arc<dyn NowPlayingBridge>,
    volume: Arc<dyn SystemVolume>,
    poller: Arc<PollingSynchronizer<NowPlayingFetch>>,
    notifications: Mutex<Option<CancellationToken>>,
    toggle_settle: Duration,
    track_settle: Duration,
}

impl LocalSource {
    pub fn new(
        bridge: Arc<dyn NowPlayingBridge>,
        volume: Arc<dyn SystemVolume>,
        fallback: Option<Arc<dyn FallbackPlayerQuery>>,
        bus: SharedBus,
        poll_interval: Duration,
    ) -> Self {
        let state = Arc::new(tokio::sync::RwLock::new(SourceState::new(
            SourceId::local(None, None),
            Capabilities::LOCAL,
        )));
        let fetch = Arc::new(NowPlayingFetch {
            bridge: bridge.clone(),
            fallback,
        });
        Self {
            bridge,
            volume,
            poller: Arc::new(PollingSynchronizer::new(
                fetch,
                state,
                bus,
                SourceKind::Local,
                poll_interval,
            )),
            notifications: Mutex::new(None),
            toggle_settle: TOGGLE_SETTLE,
            track_settle: TRACK_SETTLE,
        }
    }

    /// Override the post-command settle delays (toggle, next/previous)
    pub fn with_settle_delays(mut self, toggle: Duration, track: Duration) -> Self {
        self.toggle_settle = toggle;
        self.track_settle = track;
        self
    }

    /// Re-read OS volume and mute into the state
    pub async fn refresh_system_volume(&self) {
        let volume = self.volume.volume().await;
        let muted = self.volume.is_muted().await;
        let mut state = self.poller.state().write().await;
        match volume {
            Ok(level) => state.extras.volume = level.min(100),
            Err(e) => debug!("System volume unavailable: {}", e),
        }
        if let Ok(muted) = muted {
            state.extras.muted = muted;
        }
    }

    pub async fn toggle_mute(&self) -> Result<(), SourceError> {
        let muted = self.poller.state().read().await.extras.muted;
        self.set_mute(!muted).await
    }

    async fn send(&self, command: TransportCommand, settle: Duration) -> Result<(), SourceError> {
        self.bridge.send_command(command).await?;
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        self.poller.refresh_now().await;
        Ok(())
    }

    fn spawn_notification_loop(
        &self,
        mut rx: broadcast::Receiver<crate::adapters::now_playing::NowPlayingNotification>,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let poller = self.poller.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(notification) => {
                            debug!("Now-playing notification: {:?}", notification);
                            poller.refresh_now().await;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => poller.refresh_now().await,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        token
    }
}

#[async_trait]
impl MediaSource for LocalSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LOCAL
    }

    async fn identifier(&self) -> SourceId {
        self.poller.state().read().await.identifier.clone()
    }

    async fn is_available(&self) -> bool {
        self.poller.state().read().await.available
    }

    async fn snapshot(&self) -> MediaSnapshot {
        self.poller.state().read().await.snapshot.clone()
    }

    async fn state(&self) -> SourceState {
        self.poller.state().read().await.clone()
    }

    async fn start_monitoring(&self) {
        if self.poller.is_running().await {
            return;
        }

        let mut notifications = self.notifications.lock().await;
        if let Some(rx) = self.bridge.register_for_notifications() {
            *notifications = Some(self.spawn_notification_loop(rx));
        }
        drop(notifications);

        self.refresh_system_volume().await;
        self.poller.start().await;
    }

    async fn stop_monitoring(&self) {
        if let Some(token) = self.notifications.lock().await.take() {
            token.cancel();
            self.bridge.unregister_for_notifications();
        }
        self.poller.stop().await;
    }

    async fn toggle_play_pause(&self) -> Result<(), SourceError> {
        self.send(TransportCommand::TogglePlayPause, self.toggle_settle)
            .await
    }

    async fn next(&self) -> Result<(), SourceError> {
        self.send(TransportCommand::NextTrack, self.track_settle).await
    }

    async fn previous(&self) -> Result<(), SourceError> {
        self.send(TransportCommand::PreviousTrack, self.track_settle)
            .await
    }

    /// OS sessions don't seek reliably; accepted and ignored
    async fn seek(&self, _seconds: u32) -> Result<(), SourceError> {
        Ok(())
    }

    async fn set_volume(&self, level: i32) -> Result<(), SourceError> {
        let level = clamp_volume(level);
        self.volume.set_volume(level).await?;
        self.poller.state().write().await.extras.volume = level;
        Ok(())
    }

    async fn set_mute(&self, muted: bool) -> Result<(), SourceError> {
        self.volume.set_muted(muted).await?;
        self.poller.state().write().await.extras.muted = muted;
        Ok(())
    }
}
