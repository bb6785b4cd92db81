//! Server assembly
//!
//! Wires discovery, registry, terminator, engine and control surface
//! together, and owns the shutdown broadcast every task observes.

use crate::config::Config;
use crate::control::ControlSurface;
use crate::discovery::{AdvertiserConfig, DiscoveryBrowser, RaopAdvertiser};
use crate::error::ServerError;
use crate::registry::ReceiverRegistry;
use crate::session::RaopServer;
use crate::session::server::SessionDeps;
use crate::stats::ServerStats;
use crate::sync::{EngineHandle, SyncEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// A started server
pub struct MultiroomServer {
    control: ControlSurface,
    registry: Arc<ReceiverRegistry>,
    stats: Arc<ServerStats>,
    engine: EngineHandle,
    shutdown: broadcast::Sender<()>,
    raop_addr: SocketAddr,
    advertiser: Option<RaopAdvertiser>,
    browser: Option<DiscoveryBrowser>,
}

impl MultiroomServer {
    /// Start every subsystem.
    ///
    /// Discovery failures degrade to manual-receivers-only operation;
    /// only an unusable RAOP port is fatal.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::RaopBind`] when the RAOP listener cannot
    /// bind (exit code 1).
    pub async fn start(config: Config) -> Result<Self, ServerError> {
        let stats = ServerStats::new();
        let (shutdown, _) = broadcast::channel(1);
        let registry = ReceiverRegistry::new();

        // Fatal bind first: no point discovering receivers we cannot feed
        let raop = RaopServer::bind(config.airplay.port).await?;
        let raop_addr = raop.local_addr();

        let (browser, advertiser) = start_discovery(&config, &registry, &stats, &shutdown);

        tokio::spawn(
            registry
                .clone()
                .run_maintenance(shutdown.subscribe()),
        );

        load_manual_devices(&config, &registry);

        let engine = SyncEngine::spawn(
            config.synchronization.clone(),
            registry.clone(),
            stats.clone(),
            shutdown.clone(),
        );

        let control = ControlSurface::new(
            registry.clone(),
            engine.clone(),
            stats.clone(),
            shutdown.subscribe(),
        );

        let deps = SessionDeps {
            engine: engine.clone(),
            stats: stats.clone(),
            read_timeout: Duration::from_secs(config.network.read_timeout.max(1)),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(raop.run(deps, shutdown.subscribe()));

        tracing::info!(
            raop = %raop_addr,
            service = %config.airplay.service_name,
            "multiroom server running"
        );

        Ok(Self {
            control,
            registry,
            stats,
            engine,
            shutdown,
            raop_addr,
            advertiser,
            browser,
        })
    }

    /// Control surface for the outer shell
    #[must_use]
    pub fn control(&self) -> &ControlSurface {
        &self.control
    }

    /// The receiver registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ReceiverRegistry> {
        &self.registry
    }

    /// Shared counters
    #[must_use]
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Sync engine handle
    #[must_use]
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Bound RAOP listener address
    #[must_use]
    pub fn raop_addr(&self) -> SocketAddr {
        self.raop_addr
    }

    /// Signal shutdown and give tasks their 2 s exit window
    pub async fn shutdown(mut self) {
        tracing::info!("shutting down");
        let _ = self.shutdown.send(());
        if let Some(mut advertiser) = self.advertiser.take() {
            advertiser.unregister();
        }
        if let Some(browser) = self.browser.take() {
            browser.shutdown();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Start browsing and advertising. Any failure here degrades instead
/// of aborting: the server keeps running with manual receivers only
/// and reports `auto_discovery=false` in stats.
fn start_discovery(
    config: &Config,
    registry: &Arc<ReceiverRegistry>,
    stats: &Arc<ServerStats>,
    shutdown: &broadcast::Sender<()>,
) -> (Option<DiscoveryBrowser>, Option<RaopAdvertiser>) {
    if !config.devices.auto_discovery {
        tracing::info!("mDNS browsing disabled by configuration");
        stats.set_auto_discovery(false);
        return (None, try_advertise_standalone(config));
    }

    let browser = match DiscoveryBrowser::start(config.network.ipv6_enabled) {
        Ok(browser) => browser,
        Err(e) => {
            tracing::warn!(error = %e, "discovery unavailable, running degraded");
            stats.set_auto_discovery(false);
            return (None, None);
        }
    };
    stats.set_auto_discovery(true);

    let advertiser = RaopAdvertiser::register(
        browser.daemon().clone(),
        &AdvertiserConfig {
            name: config.airplay.service_name.clone(),
            port: config.airplay.port,
            sample_rate: config.airplay.sample_rate,
            sample_size: config.airplay.bit_depth,
            channels: config.airplay.channels,
        },
    )
    .map_err(|e| tracing::warn!(error = %e, "advertisement failed, senders must be configured manually"))
    .ok();

    // Feed discovery events into the registry
    let mut discovery_events = browser.subscribe();
    let registry = registry.clone();
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = discovery_events.recv() => match event {
                    Ok(event) => registry.apply_discovery_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "discovery events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = stop.recv() => break,
            }
        }
    });

    (Some(browser), advertiser)
}

fn try_advertise_standalone(config: &Config) -> Option<RaopAdvertiser> {
    let daemon = mdns_sd::ServiceDaemon::new()
        .map_err(|e| tracing::warn!(error = %e, "cannot advertise RAOP service"))
        .ok()?;
    RaopAdvertiser::register(
        daemon,
        &AdvertiserConfig {
            name: config.airplay.service_name.clone(),
            port: config.airplay.port,
            sample_rate: config.airplay.sample_rate,
            sample_size: config.airplay.bit_depth,
            channels: config.airplay.channels,
        },
    )
    .map_err(|e| tracing::warn!(error = %e, "cannot advertise RAOP service"))
    .ok()
}

/// Register configured manual receivers in the background; each probe
/// may take up to 5 s and must not delay startup.
fn load_manual_devices(config: &Config, registry: &Arc<ReceiverRegistry>) {
    let devices: Vec<_> = config
        .devices
        .manual_devices
        .iter()
        .filter(|d| d.enabled)
        .cloned()
        .collect();
    if devices.is_empty() {
        return;
    }

    let registry = registry.clone();
    tokio::spawn(async move {
        for device in devices {
            match registry
                .add_manual(&device.name, &device.host, device.port)
                .await
            {
                Ok(id) => tracing::info!(id = %id, name = %device.name, "manual receiver loaded"),
                Err(e) => {
                    tracing::error!(name = %device.name, error = %e, "manual receiver rejected");
                }
            }
        }
    });
}
