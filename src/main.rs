//! WiiM Control - Rust Implementation
//!
//! Arbitrates playback control between a WiiM streamer and local media.

use wiim_control::adapters::linkplay::{DeviceEndpoint, LinkplayClient};
use wiim_control::adapters::local::LocalSource;
use wiim_control::adapters::now_playing::{SpotifyScriptQuery, UnsupportedBridge, UnsupportedVolume};
use wiim_control::adapters::wiim::WiimSource;
use wiim_control::adapters::wiim_discovery::DeviceDiscovery;
use wiim_control::arbitrator::SourceArbitrator;
use wiim_control::bus::{self, BusEvent};
use wiim_control::config::{self, JsonSettingsStore, SharedSettings};
use wiim_control::console::{Console, Outcome};

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wiim_control=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting WiiM Control v{} ({})",
        env!("WIIM_VERSION"),
        env!("WIIM_GIT_SHA")
    );

    // Load configuration
    let config = config::load_config()?;
    tracing::info!(
        "Configuration loaded, poll interval: {}ms",
        config.poll_interval_ms
    );

    let bus = bus::create_bus();
    let settings: SharedSettings = Arc::new(JsonSettingsStore::default_location());

    // Remote source
    let client = LinkplayClient::new(&config.http)?;
    let remote = Arc::new(WiimSource::new(
        client,
        settings.clone(),
        bus.clone(),
        config.poll_interval(),
    ));
    let discovery = Arc::new(DeviceDiscovery::new(bus.clone(), config.discovery_timeout()));

    // Fires on Ctrl+C or SIGTERM
    let signalled = CancellationToken::new();
    tokio::spawn({
        let signalled = signalled.clone();
        async move {
            shutdown_signal().await;
            signalled.cancel();
        }
    });

    if let Some(ref device) = config.device {
        let endpoint = DeviceEndpoint::new(device.host.clone()).with_port(device.port);
        remote
            .use_endpoint(endpoint, device.name.clone().unwrap_or_default())
            .await;
        tracing::info!("WiiM device set from configuration: {}", device.host);
    } else if !remote.load_saved_device().await {
        // First run: adopt the device only when the choice is unambiguous
        tracing::info!("No WiiM device configured, searching the network...");
        let found = tokio::select! {
            _ = signalled.cancelled() => None,
            found = discovery.discover() => Some(found),
        };
        match found {
            None => tracing::info!("Discovery interrupted"),
            Some(Ok(devices)) if devices.len() == 1 => remote.configure_device(&devices[0]).await,
            Some(Ok(devices)) if devices.is_empty() => {
                tracing::warn!("No WiiM devices found; run `discover` then `use <n>`")
            }
            Some(Ok(devices)) => tracing::info!(
                "Found {} WiiM devices; pick one with `devices` and `use <n>`",
                devices.len()
            ),
            Some(Err(e)) => tracing::warn!("Discovery failed: {}", e),
        }
    }

    // Local source
    let local = Arc::new(LocalSource::new(
        Arc::new(UnsupportedBridge),
        Arc::new(UnsupportedVolume),
        Some(Arc::new(SpotifyScriptQuery)),
        bus.clone(),
        config.poll_interval(),
    ));

    let arbitrator = Arc::new(SourceArbitrator::new(
        remote,
        local,
        bus.clone(),
        settings,
    ));
    arbitrator.start().await;

    let shutdown = CancellationToken::new();
    let event_log = tokio::spawn(log_events(bus.subscribe(), shutdown.clone()));

    let console = Console::new(arbitrator.clone(), discovery.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Type `help` for commands.");

    loop {
        tokio::select! {
            _ = signalled.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => match console.handle_line_until(&line, &signalled).await {
                    Some(Outcome::Continue(text)) if text.is_empty() => {}
                    Some(Outcome::Continue(text)) => println!("{}", text),
                    Some(Outcome::Quit) | None => break,
                },
                Ok(None) => {
                    // Detached stdin: keep running until signalled
                    signalled.cancelled().await;
                    break;
                }
                Err(e) => {
                    tracing::warn!("Console input failed: {}", e);
                    signalled.cancelled().await;
                    break;
                }
            }
        }
    }

    tracing::info!("Shutting down...");
    bus.publish(BusEvent::ShuttingDown {
        reason: Some("user request".to_string()),
    });
    discovery.stop().await;
    arbitrator.stop().await;
    shutdown.cancel();
    let _ = event_log.await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Log what happens on the bus at a human-friendly level
async fn log_events(mut rx: broadcast::Receiver<BusEvent>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Ok(BusEvent::ActiveSourceChanged { current, .. }) => {
                    tracing::info!("Now controlling {}", current.display_name());
                }
                Ok(BusEvent::TrackChanged { source, title, artist, .. }) => {
                    tracing::info!("[{}] {} - {}", source, title, artist);
                }
                Ok(BusEvent::DeviceConfigured { device }) => {
                    tracing::info!("WiiM device: {} ({})", device.display_name(), device.host);
                }
                Ok(event) => tracing::trace!("bus: {}", event.event_type()),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
