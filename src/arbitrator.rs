//! SourceArbitrator - picks which source is active and routes commands to it
//!
//! Re-evaluates on every source notification and mode change. Evaluations are
//! serialized, and an `ActiveSourceChanged` event is published only when the
//! active identifier actually changes.

use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::linkplay_status::Preset;
use crate::adapters::local::LocalSource;
use crate::adapters::traits::{
    Capabilities, Capability, MediaSnapshot, MediaSource, SourceError, SourceState,
};
use crate::adapters::wiim::WiimSource;
use crate::bus::{ArbitrationMode, BusEvent, SharedBus, SourceId, SourceKind};
use crate::config::SharedSettings;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    #[error("{kind} source does not support {capability}")]
    Unsupported {
        kind: SourceKind,
        capability: Capability,
    },
    #[error("{kind} command failed: {error}")]
    CommandFailed {
        kind: SourceKind,
        #[source]
        error: SourceError,
    },
}

/// What the selection policy needs to know about a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceReading {
    pub available: bool,
    pub playing: bool,
}

impl From<&SourceState> for SourceReading {
    fn from(state: &SourceState) -> Self {
        Self {
            available: state.available,
            playing: state.snapshot.playing,
        }
    }
}

/// Selection policy. Automatic mode prefers whatever is playing (remote
/// first), then whatever is available (remote first), then local.
pub fn select_source(
    mode: ArbitrationMode,
    remote: SourceReading,
    local: SourceReading,
) -> SourceKind {
    match mode {
        ArbitrationMode::ForceRemote => SourceKind::Remote,
        ArbitrationMode::ForceLocal => SourceKind::Local,
        ArbitrationMode::Automatic => {
            if remote.available && remote.playing {
                SourceKind::Remote
            } else if local.available && local.playing {
                SourceKind::Local
            } else if remote.available {
                SourceKind::Remote
            } else {
                SourceKind::Local
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSourceDecision {
    pub kind: SourceKind,
    /// Identifier the source had when selected
    pub identifier: SourceId,
}

pub struct SourceArbitrator {
    remote: Arc<WiimSource>,
    local: Arc<LocalSource>,
    bus: SharedBus,
    settings: SharedSettings,
    mode: RwLock<ArbitrationMode>,
    active: RwLock<Option<ActiveSourceDecision>>,
    /// Serializes evaluations
    gate: Mutex<()>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl SourceArbitrator {
    pub fn new(
        remote: Arc<WiimSource>,
        local: Arc<LocalSource>,
        bus: SharedBus,
        settings: SharedSettings,
    ) -> Self {
        let mode = settings.load().mode;
        Self {
            remote,
            local,
            bus,
            settings,
            mode: RwLock::new(mode),
            active: RwLock::new(None),
            gate: Mutex::new(()),
            shutdown: Mutex::new(None),
        }
    }

    pub fn remote(&self) -> &Arc<WiimSource> {
        &self.remote
    }

    pub fn local(&self) -> &Arc<LocalSource> {
        &self.local
    }

    /// Start both sources and the evaluation loop. No-op if already running.
    pub async fn start(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.lock().await;
        if shutdown.is_some() {
            return;
        }

        // Subscribe before the sources start so no first notification is missed
        let rx = self.bus.subscribe();
        let token = CancellationToken::new();
        tokio::spawn(self.clone().run(rx, token.clone()));
        *shutdown = Some(token);
        drop(shutdown);

        info!("SourceArbitrator started (mode: {})", self.mode().await);

        tokio::join!(
            self.remote.start_monitoring(),
            self.local.start_monitoring()
        );
        self.recompute().await;
    }

    async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<BusEvent>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) if event.affects_arbitration() => {
                        self.recompute().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Arbitrator lagged by {} events, re-evaluating", skipped);
                        self.recompute().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        debug!("SourceArbitrator loop stopped");
    }

    /// Stop the loop and both sources. Idempotent.
    pub async fn stop(&self) {
        if let Some(token) = self.shutdown.lock().await.take() {
            token.cancel();
            self.remote.stop_monitoring().await;
            self.local.stop_monitoring().await;
            info!("SourceArbitrator stopped");
        }
    }

    /// Apply the selection policy. Returns the `(previous, current)` pair when
    /// the active identifier changed.
    pub async fn recompute(&self) -> Option<(Option<SourceId>, SourceId)> {
        let _gate = self.gate.lock().await;

        let mode = *self.mode.read().await;
        let remote = self.remote.state().await;
        let local = self.local.state().await;

        let kind = select_source(mode, (&remote).into(), (&local).into());
        let identifier = match kind {
            SourceKind::Remote => remote.identifier,
            SourceKind::Local => local.identifier,
        };

        let previous = {
            let mut active = self.active.write().await;
            let previous = active.as_ref().map(|d| d.identifier.clone());
            if previous.as_ref() == Some(&identifier) {
                return None;
            }
            *active = Some(ActiveSourceDecision {
                kind,
                identifier: identifier.clone(),
            });
            previous
        };

        info!(
            "Active source: {} -> {}",
            previous
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "none".to_string()),
            identifier
        );
        self.bus.publish(BusEvent::ActiveSourceChanged {
            previous: previous.clone(),
            current: identifier.clone(),
        });
        Some((previous, identifier))
    }

    // =========================================================================
    // Read surface
    // =========================================================================

    pub async fn mode(&self) -> ArbitrationMode {
        *self.mode.read().await
    }

    pub async fn active(&self) -> Option<ActiveSourceDecision> {
        self.active.read().await.clone()
    }

    pub async fn active_kind(&self) -> Option<SourceKind> {
        self.active.read().await.as_ref().map(|d| d.kind)
    }

    pub async fn active_identifier(&self) -> Option<SourceId> {
        self.active.read().await.as_ref().map(|d| d.identifier.clone())
    }

    /// Where commands go: the active source, local before the first selection
    pub async fn command_target(&self) -> SourceKind {
        self.active_kind().await.unwrap_or(SourceKind::Local)
    }

    fn source(&self, kind: SourceKind) -> &dyn MediaSource {
        match kind {
            SourceKind::Remote => self.remote.as_ref(),
            SourceKind::Local => self.local.as_ref(),
        }
    }

    pub async fn current_state(&self) -> SourceState {
        self.source(self.command_target().await).state().await
    }

    pub async fn current_snapshot(&self) -> MediaSnapshot {
        self.source(self.command_target().await).snapshot().await
    }

    pub async fn capabilities(&self) -> Capabilities {
        self.source(self.command_target().await).capabilities()
    }

    /// Cached presets of the remote device, regardless of which source is active
    pub async fn presets(&self) -> Vec<Preset> {
        self.remote.presets().await
    }

    pub async fn eq_presets(&self) -> Vec<String> {
        self.remote.eq_presets().await
    }

    pub async fn current_eq(&self) -> Option<String> {
        self.remote.current_eq().await
    }

    // =========================================================================
    // Mode
    // =========================================================================

    /// Change and persist the mode, then re-evaluate.
    pub async fn set_mode(&self, mode: ArbitrationMode) {
        {
            let mut current = self.mode.write().await;
            if *current == mode {
                return;
            }
            *current = mode;
        }
        self.settings.update(&|s| s.mode = mode);
        info!("Arbitration mode: {}", mode);
        self.bus.publish(BusEvent::ModeChanged { mode });
        self.recompute().await;
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn target(&self, capability: Capability) -> Result<&dyn MediaSource, ControlError> {
        let kind = self.command_target().await;
        let source = self.source(kind);
        if !source.capabilities().supports(capability) {
            return Err(ControlError::Unsupported { kind, capability });
        }
        Ok(source)
    }

    async fn remote_target(&self, capability: Capability) -> Result<&WiimSource, ControlError> {
        match self.command_target().await {
            SourceKind::Remote => Ok(self.remote.as_ref()),
            kind => Err(ControlError::Unsupported { kind, capability }),
        }
    }

    fn failed(kind: SourceKind, error: SourceError) -> ControlError {
        warn!("{} command failed: {}", kind, error);
        ControlError::CommandFailed { kind, error }
    }

    pub async fn toggle_play_pause(&self) -> Result<(), ControlError> {
        let source = self.target(Capability::PlayPause).await?;
        source
            .toggle_play_pause()
            .await
            .map_err(|e| Self::failed(source.kind(), e))
    }

    pub async fn next(&self) -> Result<(), ControlError> {
        let source = self.target(Capability::Next).await?;
        source.next().await.map_err(|e| Self::failed(source.kind(), e))
    }

    pub async fn previous(&self) -> Result<(), ControlError> {
        let source = self.target(Capability::Previous).await?;
        source
            .previous()
            .await
            .map_err(|e| Self::failed(source.kind(), e))
    }

    pub async fn seek(&self, seconds: u32) -> Result<(), ControlError> {
        let source = self.target(Capability::Seek).await?;
        source
            .seek(seconds)
            .await
            .map_err(|e| Self::failed(source.kind(), e))
    }

    pub async fn set_volume(&self, level: i32) -> Result<(), ControlError> {
        let source = self.target(Capability::Volume).await?;
        source
            .set_volume(level)
            .await
            .map_err(|e| Self::failed(source.kind(), e))
    }

    pub async fn set_mute(&self, muted: bool) -> Result<(), ControlError> {
        let source = self.target(Capability::Volume).await?;
        source
            .set_mute(muted)
            .await
            .map_err(|e| Self::failed(source.kind(), e))
    }

    pub async fn toggle_mute(&self) -> Result<(), ControlError> {
        let muted = self.current_state().await.extras.muted;
        self.set_mute(!muted).await
    }

    pub async fn play_preset(&self, number: u32) -> Result<(), ControlError> {
        let remote = self.remote_target(Capability::Presets).await?;
        remote
            .play_preset(number)
            .await
            .map_err(|e| Self::failed(SourceKind::Remote, e))
    }

    pub async fn load_eq_preset(&self, name: &str) -> Result<(), ControlError> {
        let remote = self.remote_target(Capability::Equalizer).await?;
        remote
            .load_eq_preset(name)
            .await
            .map_err(|e| Self::failed(SourceKind::Remote, e))
    }
}
