//! Remote media source backed by a WiiM / LinkPlay streamer
//!
//! Polls `getPlayerStatus` through the shared poller and layers the device
//! extras on top: stored presets, EQ presets, mute and preset artwork.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adapters::linkplay::{clamp_volume, DeviceEndpoint, LinkplayClient};
use crate::adapters::linkplay_status::{PlayerStatus, Preset};
use crate::adapters::poller::{Fetched, PollingSynchronizer, StatusFetch};
use crate::adapters::traits::{
    Artwork, Capabilities, MediaSnapshot, MediaSource, RemoteExtras, SourceError, SourceState,
};
use crate::adapters::wiim_discovery::Device;
use crate::bus::{BusEvent, SharedBus, SourceId, SourceKind};
use crate::config::{SavedDevice, SharedSettings};

/// Wait after commands that move to another track before re-reading status
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

fn snapshot_from_status(status: &PlayerStatus) -> MediaSnapshot {
    MediaSnapshot {
        title: status.decoded_title(),
        artist: status.decoded_artist(),
        album: status.decoded_album(),
        artwork: status.album_art_url().map(Artwork::Url),
        playing: status.is_playing(),
        position: Duration::from_secs(u64::from(status.position_secs())),
        duration: Duration::from_secs(u64::from(status.duration_secs())),
    }
}

/// Poll half of the remote source
pub struct DeviceStatusFetch {
    client: LinkplayClient,
    device_name: RwLock<String>,
    /// Artwork of the last triggered preset, held while the stream's
    /// titles still look like that preset
    pinned_artwork: RwLock<Option<Artwork>>,
}

#[async_trait]
impl StatusFetch for DeviceStatusFetch {
    async fn fetch(&self) -> Result<Fetched, SourceError> {
        let status = self.client.get_player_status().await?;
        let device_name = self.device_name.read().await.clone();
        Ok(Fetched {
            identifier: SourceId::remote(device_name),
            snapshot: snapshot_from_status(&status),
            available: true,
            volume: Some((status.volume_level(), status.is_muted())),
        })
    }

    async fn resolve_artwork(&self, fetched: &Fetched, previous: &SourceState) -> Option<Artwork> {
        let mut pinned = self.pinned_artwork.write().await;
        if let Some(artwork) = pinned.as_ref() {
            let presets = previous
                .extras
                .remote
                .as_ref()
                .map(|r| r.presets.as_slice())
                .unwrap_or_default();
            if presets
                .iter()
                .any(|p| p.matches_title(&fetched.snapshot.title))
            {
                return Some(artwork.clone());
            }
            debug!("Preset artwork released for {:?}", fetched.snapshot.title);
            *pinned = None;
        }
        fetched.snapshot.artwork.clone()
    }
}

async fn cache_presets(
    client: &LinkplayClient,
    state: &RwLock<SourceState>,
) -> Result<Vec<Preset>, SourceError> {
    let presets = client.get_presets().await?;
    debug!("Fetched {} presets", presets.len());
    if let Some(remote) = state.write().await.extras.remote.as_mut() {
        remote.presets = presets.clone();
    }
    Ok(presets)
}

async fn cache_eq_presets(
    client: &LinkplayClient,
    state: &RwLock<SourceState>,
) -> Result<Vec<String>, SourceError> {
    let eq_presets = client.get_eq_list().await?;
    debug!("Fetched {} EQ presets", eq_presets.len());
    if let Some(remote) = state.write().await.extras.remote.as_mut() {
        remote.eq_presets = eq_presets.clone();
    }
    Ok(eq_presets)
}

/// One-shot preset and EQ list load after monitoring starts
async fn load_extras(client: &LinkplayClient, state: &RwLock<SourceState>) {
    let (presets, eq) = tokio::join!(cache_presets(client, state), cache_eq_presets(client, state));
    if let Err(e) = presets {
        warn!("Failed to fetch presets: {}", e);
    }
    if let Err(e) = eq {
        warn!("Failed to fetch EQ presets: {}", e);
    }
}

pub struct WiimSource {
    client: LinkplayClient,
    poller: PollingSynchronizer<DeviceStatusFetch>,
    settings: SharedSettings,
    bus: SharedBus,
    /// Set by start_monitoring even when no device is configured yet, so a
    /// later configure_device picks monitoring up
    monitoring_wanted: AtomicBool,
    settle_delay: Duration,
}

impl WiimSource {
    pub fn new(
        client: LinkplayClient,
        settings: SharedSettings,
        bus: SharedBus,
        poll_interval: Duration,
    ) -> Self {
        let state = Arc::new(RwLock::new(SourceState::new(
            SourceId::remote(""),
            Capabilities::REMOTE,
        )));
        let fetch = Arc::new(DeviceStatusFetch {
            client: client.clone(),
            device_name: RwLock::new(String::new()),
            pinned_artwork: RwLock::new(None),
        });
        Self {
            client,
            poller: PollingSynchronizer::new(
                fetch,
                state,
                bus.clone(),
                SourceKind::Remote,
                poll_interval,
            ),
            settings,
            bus,
            monitoring_wanted: AtomicBool::new(false),
            settle_delay: SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn client(&self) -> &LinkplayClient {
        &self.client
    }

    pub async fn is_configured(&self) -> bool {
        self.client.is_configured().await
    }

    pub async fn device_name(&self) -> String {
        self.poller.fetcher().device_name.read().await.clone()
    }

    /// Point at the device from the saved settings. Returns false if none saved.
    pub async fn load_saved_device(&self) -> bool {
        match self.settings.load().device {
            Some(saved) => {
                info!("Using saved WiiM device {} ({})", saved.name, saved.host);
                let endpoint = DeviceEndpoint::new(saved.host.clone()).with_port(saved.port);
                self.use_endpoint(endpoint, saved.name).await;
                true
            }
            None => false,
        }
    }

    /// Switch to an endpoint without persisting it. Resets device-specific state.
    pub async fn use_endpoint(&self, endpoint: DeviceEndpoint, name: impl Into<String>) {
        let name = name.into();
        self.client.configure(Some(endpoint)).await;

        let fetch = self.poller.fetcher();
        *fetch.device_name.write().await = name.clone();
        *fetch.pinned_artwork.write().await = None;

        let mut state = self.poller.state().write().await;
        *state = SourceState::new(SourceId::remote(name), Capabilities::REMOTE);
    }

    /// Adopt a discovered device: persist it, repoint the client and restart
    /// monitoring if it was requested.
    pub async fn configure_device(&self, device: &Device) {
        let saved = SavedDevice {
            host: device.host.clone(),
            name: device.name.clone(),
            port: None,
        };
        self.settings.update(&|s| s.device = Some(saved.clone()));

        let was_running = self.poller.is_running().await;
        self.poller.stop().await;

        self.use_endpoint(DeviceEndpoint::new(device.host.clone()), device.name.clone())
            .await;
        info!("Configured WiiM device {} ({})", device.display_name(), device.host);
        self.bus.publish(BusEvent::DeviceConfigured {
            device: device.clone(),
        });

        if was_running || self.monitoring_wanted.load(Ordering::SeqCst) {
            self.start_monitoring().await;
        }
    }

    async fn refresh_after(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.poller.refresh_now().await;
    }

    async fn update_remote(&self, f: impl FnOnce(&mut RemoteExtras)) {
        let mut state = self.poller.state().write().await;
        if let Some(remote) = state.extras.remote.as_mut() {
            f(remote);
        }
    }

    async fn remote_extras(&self) -> RemoteExtras {
        self.poller
            .state()
            .read()
            .await
            .extras
            .remote
            .clone()
            .unwrap_or_default()
    }

    pub async fn presets(&self) -> Vec<Preset> {
        self.remote_extras().await.presets
    }

    pub async fn eq_presets(&self) -> Vec<String> {
        self.remote_extras().await.eq_presets
    }

    pub async fn current_eq(&self) -> Option<String> {
        self.remote_extras().await.current_eq
    }

    pub async fn fetch_presets(&self) -> Result<Vec<Preset>, SourceError> {
        cache_presets(&self.client, self.poller.state()).await
    }

    pub async fn fetch_eq_presets(&self) -> Result<Vec<String>, SourceError> {
        cache_eq_presets(&self.client, self.poller.state()).await
    }

    /// Load an EQ curve. Only a load the device accepted becomes "current";
    /// whatever the device reports about EQ is ignored.
    pub async fn load_eq_preset(&self, name: &str) -> Result<(), SourceError> {
        self.client.load_eq_preset(name).await?;
        let name = name.to_string();
        self.update_remote(|r| r.current_eq = Some(name)).await;
        Ok(())
    }

    pub async fn play_preset(&self, number: u32) -> Result<(), SourceError> {
        let artwork = self
            .presets()
            .await
            .iter()
            .find(|p| p.number == number)
            .and_then(Preset::artwork_url)
            .map(Artwork::Url);

        let previous_artwork = match &artwork {
            Some(art) => {
                *self.poller.fetcher().pinned_artwork.write().await = Some(art.clone());
                let mut state = self.poller.state().write().await;
                std::mem::replace(&mut state.snapshot.artwork, Some(art.clone()))
            }
            None => None,
        };

        if let Err(e) = self.client.play_preset(number).await {
            if artwork.is_some() {
                *self.poller.fetcher().pinned_artwork.write().await = None;
                self.poller.state().write().await.snapshot.artwork = previous_artwork;
            }
            return Err(e.into());
        }

        self.refresh_after(self.settle_delay).await;
        Ok(())
    }

    pub async fn toggle_mute(&self) -> Result<(), SourceError> {
        let muted = self.poller.state().read().await.extras.muted;
        self.set_mute(!muted).await
    }
}

#[async_trait]
impl MediaSource for WiimSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::REMOTE
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
        self.monitoring_wanted.store(true, Ordering::SeqCst);
        if !self.client.is_configured().await {
            debug!("No WiiM device configured, not polling");
            return;
        }
        if self.poller.is_running().await {
            return;
        }

        self.poller.start().await;

        // Extras load in the background and die with this poll run
        if let Some(token) = self.poller.run_token().await {
            let client = self.client.clone();
            let state = self.poller.state().clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => debug!("Preset/EQ load abandoned"),
                    _ = load_extras(&client, &state) => {}
                }
            });
        }
    }

    async fn stop_monitoring(&self) {
        self.monitoring_wanted.store(false, Ordering::SeqCst);
        self.poller.stop().await;
    }

    async fn toggle_play_pause(&self) -> Result<(), SourceError> {
        let playing = self.poller.state().read().await.snapshot.playing;
        self.client.toggle_play_pause(playing).await?;
        self.refresh_after(Duration::ZERO).await;
        Ok(())
    }

    async fn next(&self) -> Result<(), SourceError> {
        self.client.next().await?;
        self.refresh_after(self.settle_delay).await;
        Ok(())
    }

    async fn previous(&self) -> Result<(), SourceError> {
        self.client.previous().await?;
        self.refresh_after(self.settle_delay).await;
        Ok(())
    }

    async fn seek(&self, seconds: u32) -> Result<(), SourceError> {
        self.client.seek(seconds).await?;
        self.poller.state().write().await.snapshot.position =
            Duration::from_secs(u64::from(seconds));
        Ok(())
    }

    async fn set_volume(&self, level: i32) -> Result<(), SourceError> {
        self.client.set_volume(level).await?;
        self.poller.state().write().await.extras.volume = clamp_volume(level);
        Ok(())
    }

    async fn set_mute(&self, muted: bool) -> Result<(), SourceError> {
        self.client.set_mute(muted).await?;
        self.poller.state().write().await.extras.muted = muted;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::bus::create_bus;
    use crate::config::{HttpConfig, MemorySettingsStore, SettingsStore};
    use tokio_util::sync::CancellationToken;

    fn source(settings: Arc<MemorySettingsStore>) -> WiimSource {
        let client = LinkplayClient::new(&HttpConfig::default()).unwrap();
        WiimSource::new(client, settings, create_bus(), Duration::from_secs(60))
    }

    fn preset(number: u32, name: &str) -> Preset {
        Preset {
            number,
            name: Some(name.to_string()),
            url: None,
            source: None,
            picurl: Some(format!("https://art.example/{}.png", number)),
        }
    }

    #[test]
    fn status_maps_to_snapshot() {
        let status: PlayerStatus = serde_json::from_str(
            r#"{"status":"play","Title":"48656C6C6F","Artist":"Some%20One","curpos":"61500","totlen":"-1","albumart_uri":"https://art.example/a.jpg"}"#,
        )
        .unwrap();
        let snapshot = snapshot_from_status(&status);
        assert_eq!(snapshot.title, "Hello");
        assert_eq!(snapshot.artist, "Some One");
        assert!(snapshot.playing);
        assert_eq!(snapshot.position, Duration::from_secs(61));
        assert_eq!(snapshot.duration, Duration::ZERO);
        assert!(matches!(snapshot.artwork, Some(Artwork::Url(_))));
    }

    #[tokio::test]
    async fn start_without_device_is_noop() {
        let source = source(Arc::new(MemorySettingsStore::default()));
        source.start_monitoring().await;
        assert!(!source.poller.is_running().await);
        assert!(!source.is_available().await);
        assert_eq!(source.identifier().await.display_name(), "WiiM");
    }

    #[tokio::test]
    async fn saved_device_is_loaded() {
        let settings = Arc::new(MemorySettingsStore::new(crate::config::Settings {
            device: Some(SavedDevice {
                host: "10.0.0.9".to_string(),
                name: "Office".to_string(),
                port: None,
            }),
            ..Default::default()
        }));
        let source = source(settings);
        assert!(source.load_saved_device().await);
        assert!(source.is_configured().await);
        assert_eq!(source.identifier().await, SourceId::remote("Office"));
        assert_eq!(source.client().endpoint().await.unwrap().host, "10.0.0.9");
    }

    #[tokio::test]
    async fn configure_device_persists_and_announces() {
        let settings = Arc::new(MemorySettingsStore::default());
        let source = source(settings.clone());
        let mut rx = source.bus.subscribe();

        source
            .configure_device(&Device::new("Den", "192.0.2.10", 49152))
            .await;

        let saved = settings.load().device.unwrap();
        assert_eq!(saved.host, "192.0.2.10");
        assert_eq!(saved.name, "Den");
        assert!(matches!(
            rx.try_recv().unwrap(),
            BusEvent::DeviceConfigured { device } if device.name == "Den"
        ));
        // Monitoring was never requested
        assert!(!source.poller.is_running().await);
    }

    /// Accepts connections and never answers
    async fn silent_endpoint() -> (DeviceEndpoint, CancellationToken) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let token = CancellationToken::new();
        let server_token = token.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                tokio::select! {
                    _ = server_token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => held.push(stream),
                        Err(_) => break,
                    },
                }
            }
        });
        let endpoint = DeviceEndpoint::new("127.0.0.1")
            .with_port(Some(port))
            .with_scheme(crate::adapters::linkplay::Scheme::Http);
        (endpoint, token)
    }

    #[tokio::test]
    async fn start_does_not_wait_for_silent_device() {
        let (endpoint, server) = silent_endpoint().await;
        let source = source(Arc::new(MemorySettingsStore::default()));
        source.use_endpoint(endpoint, "Den").await;

        tokio::time::timeout(Duration::from_millis(500), source.start_monitoring())
            .await
            .expect("start_monitoring should return while the device is silent");
        assert!(source.poller.is_running().await);
        let token = source.poller.run_token().await.unwrap();

        source.stop_monitoring().await;
        assert!(token.is_cancelled());
        assert!(source.presets().await.is_empty());
        server.cancel();
    }

    #[tokio::test]
    async fn pinned_artwork_follows_matching_titles() {
        let source = source(Arc::new(MemorySettingsStore::default()));
        source
            .update_remote(|r| r.presets = vec![preset(1, "Radio Paradise")])
            .await;
        let pinned = Artwork::Url(url::Url::parse("https://art.example/1.png").unwrap());
        *source.poller.fetcher().pinned_artwork.write().await = Some(pinned.clone());

        let previous = source.state().await;
        let device_art = Artwork::Url(url::Url::parse("https://art.example/device.png").unwrap());
        let mut fetched = Fetched {
            identifier: SourceId::remote(""),
            snapshot: MediaSnapshot {
                title: "RADIO PARADISE - Main Mix".to_string(),
                artwork: Some(device_art.clone()),
                ..MediaSnapshot::default()
            },
            available: true,
            volume: None,
        };

        let fetch = source.poller.fetcher();
        assert_eq!(fetch.resolve_artwork(&fetched, &previous).await, Some(pinned));

        fetched.snapshot.title = "Something else entirely".to_string();
        assert_eq!(
            fetch.resolve_artwork(&fetched, &previous).await,
            Some(device_art)
        );
        assert!(fetch.pinned_artwork.read().await.is_none());
    }
}
