//! mDNS browsing for downstream receivers
//!
//! One `mdns-sd` daemon browses the three AirPlay service types and
//! publishes parsed sightings on a broadcast channel. Binding follows
//! the container-friendly ladder: IPv4-only first, then the default
//! multi-interface bind, then degraded (no browsing at all — the caller
//! keeps running with manual receivers only).

use super::parser::{self, DiscoveredService};
use futures::StreamExt;
use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use tokio::sync::broadcast;

/// Events published by the browser
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A service was seen for the first time
    Added(DiscoveredService),
    /// A known service re-resolved with (possibly) new data
    Updated(DiscoveredService),
    /// A service disappeared from the network
    Removed {
        /// Full service name of the vanished instance
        fullname: String,
    },
}

/// How the daemon ended up bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// IPv4 interfaces only (required inside restricted namespaces)
    Ipv4Only,
    /// Default multi-interface bind
    MultiInterface,
}

/// Browser startup failures
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Neither IPv4-only nor default bind succeeded
    #[error("mDNS daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// A browse registration failed
    #[error("browse failed for {service_type}: {message}")]
    BrowseFailed {
        /// Which service type could not be browsed
        service_type: String,
        /// Daemon error text
        message: String,
    },
}

/// Active mDNS browser
pub struct DiscoveryBrowser {
    daemon: ServiceDaemon,
    bind_mode: BindMode,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl DiscoveryBrowser {
    /// Create the daemon and start browsing all three service types.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] when no daemon can be created or a
    /// browse registration fails; the caller should fall back to
    /// degraded (manual-receivers-only) operation.
    pub fn start(ipv6_enabled: bool) -> Result<Self, DiscoveryError> {
        let (daemon, bind_mode) = create_daemon(ipv6_enabled)?;

        let mut streams = Vec::with_capacity(super::BROWSE_SERVICE_TYPES.len());
        for service_type in super::BROWSE_SERVICE_TYPES {
            let receiver = daemon.browse(service_type).map_err(|e| {
                DiscoveryError::BrowseFailed {
                    service_type: service_type.to_string(),
                    message: e.to_string(),
                }
            })?;
            streams.push(receiver.into_stream());
        }

        let (events, _) = broadcast::channel(64);
        let pump_events = events.clone();
        tokio::spawn(async move {
            let mut merged = futures::stream::select_all(streams);
            let mut known: HashSet<String> = HashSet::new();
            while let Some(event) = merged.next().await {
                if let Some(out) = process_event(event, &mut known) {
                    let _ = pump_events.send(out);
                }
            }
            tracing::debug!("discovery event pump ended");
        });

        tracing::info!(?bind_mode, "mDNS browsing started");

        Ok(Self {
            daemon,
            bind_mode,
            events,
        })
    }

    /// How the daemon is bound
    #[must_use]
    pub fn bind_mode(&self) -> BindMode {
        self.bind_mode
    }

    /// Subscribe to discovery events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Borrow the daemon, e.g. for registering our own advertisement
    #[must_use]
    pub fn daemon(&self) -> &ServiceDaemon {
        &self.daemon
    }

    /// Stop browsing and shut the daemon down
    pub fn shutdown(&self) {
        for service_type in super::BROWSE_SERVICE_TYPES {
            let _ = self.daemon.stop_browse(service_type);
        }
        let _ = self.daemon.shutdown();
    }
}

fn create_daemon(ipv6_enabled: bool) -> Result<(ServiceDaemon, BindMode), DiscoveryError> {
    if !ipv6_enabled {
        match try_ipv4_only() {
            Ok(daemon) => return Ok((daemon, BindMode::Ipv4Only)),
            Err(e) => {
                tracing::warn!(error = %e, "IPv4-only mDNS bind failed, trying default bind");
            }
        }
    }

    match ServiceDaemon::new() {
        Ok(daemon) => Ok((daemon, BindMode::MultiInterface)),
        Err(e) => Err(DiscoveryError::DaemonUnavailable(e.to_string())),
    }
}

fn try_ipv4_only() -> Result<ServiceDaemon, mdns_sd::Error> {
    let daemon = ServiceDaemon::new()?;
    if let Err(e) = daemon.disable_interface(IfKind::IPv6) {
        let _ = daemon.shutdown();
        return Err(e);
    }
    Ok(daemon)
}

fn process_event(event: ServiceEvent, known: &mut HashSet<String>) -> Option<DiscoveryEvent> {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let service = parse_service(&info)?;
            let fullname = service.fullname.clone();
            if known.insert(fullname) {
                tracing::info!(
                    name = %service.instance_name,
                    kind = ?service.kind,
                    port = service.port,
                    "receiver discovered"
                );
                Some(DiscoveryEvent::Added(service))
            } else {
                Some(DiscoveryEvent::Updated(service))
            }
        }
        ServiceEvent::ServiceRemoved(_, fullname) => {
            known.remove(&fullname);
            tracing::info!(name = %fullname, "receiver disappeared");
            Some(DiscoveryEvent::Removed { fullname })
        }
        _ => None,
    }
}

fn parse_service(info: &ServiceInfo) -> Option<DiscoveredService> {
    let txt: HashMap<String, String> = parser::extract_txt(
        info.get_properties()
            .iter()
            .map(|p| (p.key(), p.val().unwrap_or_default())),
    );

    let addresses: Vec<_> = info
        .get_addresses()
        .iter()
        .filter_map(|addr| match addr {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
        .collect();
    if addresses.is_empty() {
        tracing::debug!(name = %info.get_fullname(), "service has no IPv4 address, skipping");
        return None;
    }

    let fullname = info.get_fullname().to_string();
    let service_type = info.get_type().to_string();
    Some(DiscoveredService {
        instance_name: parser::instance_name(&fullname).to_string(),
        kind: parser::classify(&service_type, &txt),
        fullname,
        service_type,
        addresses,
        port: info.get_port(),
        txt,
    })
}
