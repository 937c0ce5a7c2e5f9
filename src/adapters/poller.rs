//! Generic polling synchronizer shared by both media sources
//!
//! One cancellable task per run: an immediate refresh on start, then a fixed
//! interval. Each cycle fetches, compares against the stored state and
//! publishes at most one `SourceChanged` per cycle.
//!
//! Cycles are serialized per source. A timer tick that finds a cycle in
//! flight is skipped; a command-driven refresh waits for it. Every run has an
//! epoch, and a result that lands after the epoch moved on (stop or restart)
//! is dropped.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::adapters::traits::{Artwork, MediaSnapshot, SourceError, SourceState};
use crate::bus::{BusEvent, SharedBus, SourceId, SourceKind};

/// One successful read of a backend
#[derive(Debug, Clone)]
pub struct Fetched {
    pub identifier: SourceId,
    pub snapshot: MediaSnapshot,
    pub available: bool,
    /// Volume and mute, when the backend reports them with the status
    pub volume: Option<(u8, bool)>,
}

/// Backend-specific half of a poll cycle
#[async_trait]
pub trait StatusFetch: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Fetched, SourceError>;

    /// Artwork to store when the title changed. `previous` is the state
    /// before this cycle.
    async fn resolve_artwork(&self, fetched: &Fetched, _previous: &SourceState) -> Option<Artwork> {
        fetched.snapshot.artwork.clone()
    }
}

struct PollerInner<F> {
    fetcher: Arc<F>,
    state: Arc<RwLock<SourceState>>,
    bus: SharedBus,
    kind: SourceKind,
    cycle: Mutex<()>,
    epoch: AtomicU64,
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub struct PollingSynchronizer<F> {
    inner: Arc<PollerInner<F>>,
    interval: Duration,
    running: Mutex<Option<CancellationToken>>,
}

impl<F: StatusFetch> PollingSynchronizer<F> {
    pub fn new(
        fetcher: Arc<F>,
        state: Arc<RwLock<SourceState>>,
        bus: SharedBus,
        kind: SourceKind,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                fetcher,
                state,
                bus,
                kind,
                cycle: Mutex::new(()),
                epoch: AtomicU64::new(0),
            }),
            // tokio's interval panics on a zero period
            interval: interval.max(MIN_INTERVAL),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<RwLock<SourceState>> {
        &self.inner.state
    }

    pub fn fetcher(&self) -> &Arc<F> {
        &self.inner.fetcher
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start the poll task. No-op if already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();
        let task_token = token.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    // First tick completes immediately
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = task_token.cancelled() => break,
                            _ = inner.tick(epoch) => {}
                        }
                    }
                }
            }
            debug!(source = %inner.kind, "Poll loop stopped");
        });

        debug!(source = %self.inner.kind, interval_ms = period.as_millis() as u64, "Poll loop started");
        *running = Some(token);
    }

    /// Token of the current run, for work that must end with it
    pub async fn run_token(&self) -> Option<CancellationToken> {
        self.running.lock().await.clone()
    }

    /// Cancel the poll task. Safe to call repeatedly or before start.
    pub async fn stop(&self) {
        if let Some(token) = self.running.lock().await.take() {
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            token.cancel();
        }
    }

    /// Refresh now, waiting for any in-flight cycle first
    pub async fn refresh_now(&self) {
        let _cycle = self.inner.cycle.lock().await;
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.run_cycle(epoch).await;
    }
}

impl<F: StatusFetch> PollerInner<F> {
    async fn tick(&self, epoch: u64) {
        let Ok(_cycle) = self.cycle.try_lock() else {
            trace!(source = %self.kind, "Cycle in flight, skipping tick");
            return;
        };
        self.run_cycle(epoch).await;
    }

    async fn run_cycle(&self, epoch: u64) {
        match self.fetcher.fetch().await {
            Ok(fetched) => self.apply(epoch, fetched).await,
            Err(e) => self.mark_unavailable(epoch, &e).await,
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    async fn apply(&self, epoch: u64, fetched: Fetched) {
        let previous = self.state.read().await.clone();
        let title_changed = fetched.snapshot.title != previous.snapshot.title;

        let artwork = if title_changed {
            self.fetcher.resolve_artwork(&fetched, &previous).await
        } else {
            previous.snapshot.artwork.clone()
        };

        let (changed, track) = {
            let mut state = self.state.write().await;
            if !self.is_current(epoch) {
                debug!(source = %self.kind, "Discarding stale poll result");
                return;
            }

            let changed = state.snapshot.title != fetched.snapshot.title
                || state.snapshot.artist != fetched.snapshot.artist
                || state.snapshot.playing != fetched.snapshot.playing
                || state.identifier != fetched.identifier
                || state.available != fetched.available;

            state.identifier = fetched.identifier;
            state.available = fetched.available;
            state.snapshot = MediaSnapshot {
                artwork,
                ..fetched.snapshot
            };
            if let Some((volume, muted)) = fetched.volume {
                state.extras.volume = volume;
                state.extras.muted = muted;
            }

            let track = (title_changed && !state.snapshot.title.is_empty()).then(|| {
                (
                    state.snapshot.title.clone(),
                    state.snapshot.artist.clone(),
                    state.snapshot.album.clone(),
                )
            });
            (changed, track)
        };

        if let Some((title, artist, album)) = track {
            debug!(source = %self.kind, %title, %artist, "Track changed");
            self.bus.publish(BusEvent::TrackChanged {
                source: self.kind,
                title,
                artist,
                album,
            });
        }
        if changed {
            self.bus.publish(BusEvent::SourceChanged { source: self.kind });
        }
    }

    async fn mark_unavailable(&self, epoch: u64, error: &SourceError) {
        debug!(source = %self.kind, "Poll failed: {}", error);

        let was_available = {
            let mut state = self.state.write().await;
            if !self.is_current(epoch) {
                return;
            }
            std::mem::replace(&mut state.available, false)
        };

        if was_available {
            self.bus.publish(BusEvent::SourceChanged { source: self.kind });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::adapters::linkplay::DeviceError;
    use crate::adapters::traits::Capabilities;
    use crate::bus::create_bus;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast;

    /// Plays back a script of fetch results, repeating the last one
    struct Scripted {
        results: std::sync::Mutex<VecDeque<Result<Fetched, SourceError>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Scripted {
        fn new(results: Vec<Result<Fetched, SourceError>>) -> Self {
            Self {
                results: std::sync::Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl StatusFetch for Scripted {
        async fn fetch(&self) -> Result<Fetched, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.pop_front().unwrap()
            } else {
                results.front().cloned().unwrap()
            }
        }
    }

    fn playing(title: &str) -> Result<Fetched, SourceError> {
        Ok(Fetched {
            identifier: SourceId::remote("Den"),
            snapshot: MediaSnapshot {
                title: title.to_string(),
                artist: "Artist".to_string(),
                playing: true,
                artwork: Some(Artwork::Data(title.as_bytes().to_vec())),
                ..MediaSnapshot::default()
            },
            available: true,
            volume: Some((30, false)),
        })
    }

    fn poller(fetcher: Scripted) -> (PollingSynchronizer<Scripted>, broadcast::Receiver<BusEvent>) {
        let bus = create_bus();
        let rx = bus.subscribe();
        let state = Arc::new(RwLock::new(SourceState::new(
            SourceId::remote("Den"),
            Capabilities::REMOTE,
        )));
        (
            PollingSynchronizer::new(
                Arc::new(fetcher),
                state,
                bus,
                SourceKind::Remote,
                Duration::from_secs(3600),
            ),
            rx,
        )
    }

    fn drain(rx: &mut broadcast::Receiver<BusEvent>) -> Vec<BusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn change_publishes_once() {
        let (poller, mut rx) = poller(Scripted::new(vec![playing("One")]));

        poller.refresh_now().await;
        let events = drain(&mut rx);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, BusEvent::SourceChanged { .. }))
                .count(),
            1
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, BusEvent::TrackChanged { title, .. } if title == "One")));

        let state = poller.state().read().await.clone();
        assert!(state.available);
        assert_eq!(state.extras.volume, 30);

        // Same data again: nothing to say
        poller.refresh_now().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn artwork_only_refreshes_on_title_change() {
        let mut same_title = playing("One").unwrap();
        same_title.snapshot.artwork = Some(Artwork::Data(b"other".to_vec()));
        same_title.snapshot.playing = false;

        let (poller, _rx) = poller(Scripted::new(vec![playing("One"), Ok(same_title)]));
        poller.refresh_now().await;
        poller.refresh_now().await;

        let snapshot = poller.state().read().await.snapshot.clone();
        assert!(!snapshot.playing);
        assert_eq!(snapshot.artwork, Some(Artwork::Data(b"One".to_vec())));
    }

    #[tokio::test]
    async fn failure_keeps_snapshot_and_notifies_once() {
        let (poller, mut rx) = poller(Scripted::new(vec![
            playing("One"),
            Err(DeviceError::Unreachable.into()),
        ]));

        poller.refresh_now().await;
        drain(&mut rx);

        poller.refresh_now().await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BusEvent::SourceChanged { .. }));

        let state = poller.state().read().await.clone();
        assert!(!state.available);
        assert_eq!(state.snapshot.title, "One");

        // Still failing: already unavailable, stay quiet
        poller.refresh_now().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn failure_when_never_available_is_silent() {
        let (poller, mut rx) = poller(Scripted::new(vec![Err(DeviceError::Timeout.into())]));
        poller.refresh_now().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn start_refreshes_immediately_and_stop_is_idempotent() {
        let (poller, mut rx) = poller(Scripted::new(vec![playing("One")]));

        poller.stop().await;
        poller.start().await;
        poller.start().await;
        assert!(poller.is_running().await);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("immediate refresh")
            .unwrap();
        assert!(matches!(
            event,
            BusEvent::TrackChanged { .. } | BusEvent::SourceChanged { .. }
        ));

        poller.stop().await;
        poller.stop().await;
        assert!(!poller.is_running().await);
        assert_eq!(poller.fetcher().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn result_after_stop_is_discarded() {
        let mut fetcher = Scripted::new(vec![playing("Late")]);
        fetcher.delay = Duration::from_millis(200);
        let (poller, mut rx) = poller(fetcher);

        poller.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.stop().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(drain(&mut rx).is_empty());
        assert!(!poller.state().read().await.available);
    }

    #[tokio::test]
    async fn forced_refresh_waits_for_in_flight_cycle() {
        let mut fetcher = Scripted::new(vec![playing("One")]);
        fetcher.delay = Duration::from_millis(100);
        let (poller, _rx) = poller(fetcher);
        let poller = Arc::new(poller);

        let first = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.refresh_now().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A timer tick while the cycle runs is skipped
        let epoch = poller.inner.epoch.load(Ordering::SeqCst);
        poller.inner.tick(epoch).await;
        assert_eq!(poller.fetcher().calls.load(Ordering::SeqCst), 1);

        // A forced refresh queues behind it
        poller.refresh_now().await;
        first.await.unwrap();
        assert_eq!(poller.fetcher().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_interval_still_polls() {
        let bus = create_bus();
        let mut rx = bus.subscribe();
        let state = Arc::new(RwLock::new(SourceState::new(
            SourceId::remote("Den"),
            Capabilities::REMOTE,
        )));
        let poller = PollingSynchronizer::new(
            Arc::new(Scripted::new(vec![playing("One")])),
            state,
            bus,
            SourceKind::Remote,
            Duration::ZERO,
        );

        poller.start().await;
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("poll task should be alive")
            .unwrap();
        poller.stop().await;
        assert!(poller.fetcher().calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn run_token_follows_lifecycle() {
        let (poller, _rx) = poller(Scripted::new(vec![playing("One")]));
        assert!(poller.run_token().await.is_none());

        poller.start().await;
        let token = poller.run_token().await.expect("running");
        assert!(!token.is_cancelled());

        poller.stop().await;
        assert!(token.is_cancelled());
        assert!(poller.run_token().await.is_none());
    }
}
