//! WiiM / LinkPlay device discovery via mDNS
//!
//! Browses `_linkplay._tcp.local.` for a bounded window. Each resolved
//! advertisement is confirmed with a short TCP probe to the advertised
//! port before the device is listed; the first address that accepts wins.
//! Probes run concurrently, so a silent address never delays the others
//! or the end of the window. Devices are deduplicated by host, first seen
//! wins.

use futures::future::{select_ok, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use mdns_sd::{ResolvedService, ServiceDaemon, ServiceEvent};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, SharedBus};

/// LinkPlay mDNS service type (trailing dot required by mdns-sd)
pub const LINKPLAY_SERVICE_TYPE: &str = "_linkplay._tcp.local.";

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Slack past the window before `discover` gives up waiting
const FINISH_GRACE: Duration = Duration::from_secs(1);
const ADVERTISEMENT_BUFFER: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Device {
    /// `host:port`
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl Device {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            id: format!("{}:{}", host, port),
            name: name.into(),
            host,
            port,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.host
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Daemon(String),
    #[error("mDNS browse failed: {0}")]
    Browse(String),
}

/// Unconfirmed service advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

impl Advertisement {
    fn from_resolved(info: &ResolvedService) -> Self {
        let mut addresses: Vec<IpAddr> = info.addresses.iter().map(|a| a.to_ip_addr()).collect();
        // IPv4 first, the device API is reliably reachable there
        addresses.sort_by_key(|a| !a.is_ipv4());
        Self {
            name: instance_name(&info.fullname),
            addresses,
            port: info.port,
        }
    }
}

/// `"WiiM Pro-4F2C._linkplay._tcp.local."` -> `"WiiM Pro-4F2C"`
pub fn instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(LINKPLAY_SERVICE_TYPE)
        .unwrap_or(fullname)
        .trim_end_matches('.')
        .to_string()
}

/// Confirm an advertisement by connecting to it. `None` if no address accepts.
pub async fn resolve_advertisement(ad: &Advertisement, probe_timeout: Duration) -> Option<Device> {
    if ad.addresses.is_empty() {
        return None;
    }

    let port = ad.port;
    let probes = ad.addresses.iter().copied().map(|addr| {
        Box::pin(async move {
            match tokio::time::timeout(probe_timeout, TcpStream::connect((addr, port))).await {
                Ok(Ok(_stream)) => Ok(addr),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("probe timed out".to_string()),
            }
        })
    });

    match select_ok(probes).await {
        Ok((addr, _)) => Some(Device::new(ad.name.clone(), addr.to_string(), port)),
        Err(e) => {
            debug!("Discovery: {} did not answer probe: {}", ad.name, e);
            None
        }
    }
}

/// Add unless a device with the same host is already listed
pub fn insert_unique_host(devices: &mut Vec<Device>, device: Device) -> bool {
    if devices.iter().any(|d| d.host == device.host) {
        return false;
    }
    devices.push(device);
    true
}

/// Where a session's advertisements come from
pub trait AdvertisementBrowser: Send + Sync {
    /// Begin browsing. Dropping the receiver ends the browse.
    fn browse(&self) -> Result<mpsc::Receiver<Advertisement>, DiscoveryError>;
}

/// mDNS browser backed by a per-session `mdns-sd` daemon
pub struct MdnsBrowser;

impl AdvertisementBrowser for MdnsBrowser {
    fn browse(&self) -> Result<mpsc::Receiver<Advertisement>, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        let receiver = match daemon.browse(LINKPLAY_SERVICE_TYPE) {
            Ok(receiver) => receiver,
            Err(e) => {
                let _ = daemon.shutdown();
                return Err(DiscoveryError::Browse(e.to_string()));
            }
        };

        let (tx, rx) = mpsc::channel(ADVERTISEMENT_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = receiver.recv_async() => match event {
                        Ok(ServiceEvent::ServiceResolved(resolved)) => {
                            if tx.send(Advertisement::from_resolved(&resolved)).await.is_err() {
                                break;
                            }
                        }
                        Ok(other) => debug!("Discovery: {:?}", other),
                        Err(e) => {
                            debug!("Discovery: browse channel closed: {}", e);
                            break;
                        }
                    }
                }
            }

            if let Err(e) = daemon.stop_browse(LINKPLAY_SERVICE_TYPE) {
                debug!("Discovery: stop_browse failed: {}", e);
            }
            if let Err(e) = daemon.shutdown() {
                debug!("Discovery: daemon shutdown failed: {}", e);
            }
        });

        Ok(rx)
    }
}

struct Session {
    id: u64,
    token: CancellationToken,
}

pub struct DeviceDiscovery {
    devices: Arc<RwLock<Vec<Device>>>,
    session: Arc<Mutex<Option<Session>>>,
    next_session: AtomicU64,
    browser: Arc<dyn AdvertisementBrowser>,
    bus: SharedBus,
    window: Duration,
}

impl DeviceDiscovery {
    pub fn new(bus: SharedBus, window: Duration) -> Self {
        Self::with_browser(bus, window, Arc::new(MdnsBrowser))
    }

    pub fn with_browser(
        bus: SharedBus,
        window: Duration,
        browser: Arc<dyn AdvertisementBrowser>,
    ) -> Self {
        Self {
            devices: Arc::new(RwLock::new(Vec::new())),
            session: Arc::new(Mutex::new(None)),
            next_session: AtomicU64::new(1),
            browser,
            bus,
            window,
        }
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.devices.read().await.clone()
    }

    pub async fn is_searching(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Begin a new session, replacing any running one. The previous list is
    /// discarded once browsing is under way; a failed start leaves it as is.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        let mut advertisements = match self.browser.browse() {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Discovery: {}", e);
                self.stop().await;
                return Err(e);
            }
        };

        // A replaced session ends without its own DiscoveryFinished
        self.cancel_session().await;
        self.devices.write().await.clear();

        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        *self.session.lock().await = Some(Session {
            id,
            token: token.clone(),
        });

        info!("Discovery: browsing {} for {:?}", LINKPLAY_SERVICE_TYPE, self.window);

        let devices = self.devices.clone();
        let session = self.session.clone();
        let bus = self.bus.clone();
        let window = self.window;

        tokio::spawn(async move {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            let mut probes: FuturesUnordered<BoxFuture<'static, Option<Device>>> =
                FuturesUnordered::new();
            let mut browsing = true;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = &mut deadline => {
                        debug!("Discovery: window elapsed with {} probe(s) pending", probes.len());
                        break;
                    }
                    Some(found) = probes.next(), if !probes.is_empty() => {
                        if let Some(device) = found {
                            let added = {
                                let mut listed = devices.write().await;
                                // A newer session cancels before it clears the list
                                if token.is_cancelled() {
                                    break;
                                }
                                insert_unique_host(&mut listed, device.clone())
                            };
                            if added {
                                info!("Discovery: found {} at {}", device.display_name(), device.id);
                                bus.publish(BusEvent::DeviceDiscovered { device });
                            }
                        }
                        if !browsing && probes.is_empty() {
                            break;
                        }
                    }
                    ad = advertisements.recv(), if browsing => match ad {
                        Some(ad) => {
                            debug!("Discovery: probing {} at {:?}", ad.name, ad.addresses);
                            probes.push(Box::pin(async move {
                                resolve_advertisement(&ad, PROBE_TIMEOUT).await
                            }));
                        }
                        None => {
                            debug!("Discovery: browse ended");
                            browsing = false;
                            if probes.is_empty() {
                                break;
                            }
                        }
                    }
                }
            }

            // Ends the browse
            drop(advertisements);

            // Only the session that still owns the flag may clear it
            let finished_self = {
                let mut current = session.lock().await;
                if current.as_ref().is_some_and(|s| s.id == id) {
                    *current = None;
                    true
                } else {
                    false
                }
            };
            if finished_self {
                let device_count = devices.read().await.len();
                info!("Discovery: finished with {} device(s)", device_count);
                bus.publish(BusEvent::DiscoveryFinished { device_count });
            }
        });

        Ok(())
    }

    /// End the current session. Idempotent.
    pub async fn stop(&self) {
        if self.cancel_session().await {
            let device_count = self.devices.read().await.len();
            self.bus.publish(BusEvent::DiscoveryFinished { device_count });
        }
    }

    async fn cancel_session(&self) -> bool {
        match self.session.lock().await.take() {
            Some(session) => {
                session.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run one full session and return what it found
    pub async fn discover(&self) -> Result<Vec<Device>, DiscoveryError> {
        let mut rx = self.bus.subscribe();
        self.start().await?;

        let grace = self.window + FINISH_GRACE;
        let finished = tokio::time::timeout(grace, async {
            loop {
                match rx.recv().await {
                    Ok(BusEvent::DiscoveryFinished { .. }) => break,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
        .await;

        if finished.is_err() {
            warn!("Discovery: session did not finish in time, stopping");
            self.stop().await;
        }
        Ok(self.devices().await)
    }
}
