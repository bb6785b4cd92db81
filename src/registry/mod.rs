//! Authoritative set of known receivers
//!
//! The registry owns every receiver record, whether discovered via mDNS
//! or configured manually. Mutations emit events on a broadcast channel
//! that the control surface and sync engine subscribe to. The lock is
//! read-mostly and never held across an await.

use crate::discovery::{DiscoveredService, DiscoveryEvent};
use crate::types::{DeviceKind, Receiver, ReceiverId, ReceiverOrigin, ReceiverStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, broadcast};

/// Probe timeout for reachability tests
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of the maintenance loop
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Discovered receivers unseen for this long are evicted
pub const EVICT_AFTER: Duration = Duration::from_secs(300);

/// Registry mutation events
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A receiver entered the registry
    Added(Receiver),
    /// A receiver's record changed (TXT update, re-resolve)
    Updated(Receiver),
    /// A receiver left the registry
    Removed(Receiver),
    /// A receiver's status changed
    StatusChanged {
        /// The receiver after the change
        receiver: Receiver,
        /// Status before the change
        old: ReceiverStatus,
    },
}

/// Registry operation failures
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The id is not registered
    #[error("receiver not found: {0}")]
    NotFound(ReceiverId),

    /// A manual receiver's host did not resolve to IPv4
    #[error("cannot resolve host {host}: {message}")]
    Unresolvable {
        /// Host as configured
        host: String,
        /// Resolution failure text
        message: String,
    },
}

/// Aggregate registry counts, surfaced through `get_stats`
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    /// Receivers registered
    pub total: usize,
    /// Of those, how many are currently available
    pub available: usize,
    /// Manually configured receivers
    pub manual: usize,
    /// mDNS-discovered receivers
    pub discovered: usize,
    /// Available receivers broken down by classified kind
    pub by_kind: HashMap<DeviceKind, usize>,
}

#[derive(Default)]
struct Inner {
    receivers: HashMap<ReceiverId, Receiver>,
    fullname_to_id: HashMap<String, ReceiverId>,
}

/// Thread-safe receiver registry
pub struct ReceiverRegistry {
    inner: RwLock<Inner>,
    events: broadcast::Sender<RegistryEvent>,
    probe_timeout: Duration,
}

impl ReceiverRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_probe_timeout(PROBE_TIMEOUT)
    }

    /// Create with a custom probe timeout (tests use a short one)
    #[must_use]
    pub fn with_probe_timeout(probe_timeout: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            events,
            probe_timeout,
        })
    }

    /// Subscribe to registry events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Insert or merge a discovered service.
    ///
    /// Insertion by id: a re-sighting of a known id merges addresses,
    /// TXT data and refreshes `last_seen`; the id itself never changes.
    pub async fn add_discovered(&self, service: &DiscoveredService) -> ReceiverId {
        let Some(host) = service.addresses.first().copied() else {
            // The browser filters address-less services already
            return ReceiverId::from_string(service.fullname.clone());
        };
        let id = ReceiverId::from_endpoint(host, service.port);

        // Event emission happens under the lock so the stream order
        // matches the mutation order per id; send() never suspends
        let mut inner = self.inner.write().await;
        inner
            .fullname_to_id
            .insert(service.fullname.clone(), id.clone());

        let event = if let Some(existing) = inner.receivers.get_mut(&id) {
            existing.name = service.instance_name.clone();
            existing.kind = service.kind;
            existing.addresses = service.addresses.clone();
            existing.model = service.model();
            existing.firmware = service.firmware();
            existing.features = service.features();
            existing.txt_records = service.txt.clone();
            existing.touch();
            RegistryEvent::Updated(existing.clone())
        } else {
            let receiver = Receiver {
                id: id.clone(),
                name: service.instance_name.clone(),
                origin: ReceiverOrigin::Discovered,
                kind: service.kind,
                addresses: service.addresses.clone(),
                port: service.port,
                model: service.model(),
                firmware: service.firmware(),
                features: service.features(),
                status: ReceiverStatus::Discovered,
                status_reason: None,
                txt_records: service.txt.clone(),
                last_seen: std::time::Instant::now(),
            };
            inner.receivers.insert(id.clone(), receiver.clone());
            RegistryEvent::Added(receiver)
        };
        let _ = self.events.send(event);
        id
    }

    /// Register a manually configured receiver.
    ///
    /// Reachability is verified with a short probe; on failure the
    /// receiver is still registered, with status `Error` and the reason
    /// recorded. Manual receivers are never silently dropped.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unresolvable`] when the host cannot be
    /// resolved to an IPv4 address at all.
    pub async fn add_manual(
        &self,
        name: &str,
        host: &str,
        port: u16,
    ) -> Result<ReceiverId, RegistryError> {
        let addr = resolve_ipv4(host, port).await?;
        let mut receiver = Receiver::manual(name, addr, port);
        let id = receiver.id.clone();

        match probe_endpoint(SocketAddr::from((addr, port)), self.probe_timeout).await {
            Ok(responded) => {
                tracing::info!(id = %id, name = %name, rtsp = responded, "manual receiver reachable");
            }
            Err(e) => {
                tracing::warn!(id = %id, name = %name, error = %e, "manual receiver unreachable, registering anyway");
                receiver.status = ReceiverStatus::Error;
                receiver.status_reason = Some(format!("reachability probe failed: {e}"));
            }
        }

        let mut inner = self.inner.write().await;
        inner.receivers.insert(id.clone(), receiver.clone());
        let _ = self.events.send(RegistryEvent::Added(receiver));
        Ok(id)
    }

    /// Remove a receiver by id
    pub async fn remove(&self, id: &ReceiverId) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .receivers
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        inner.fullname_to_id.retain(|_, mapped| mapped != id);
        let _ = self.events.send(RegistryEvent::Removed(removed));
        Ok(())
    }

    /// Remove by the service fullname a `Removed` discovery event carries
    pub async fn remove_by_fullname(&self, fullname: &str) {
        let id = {
            let inner = self.inner.read().await;
            inner.fullname_to_id.get(fullname).cloned()
        };
        if let Some(id) = id {
            let _ = self.remove(&id).await;
        }
    }

    /// Look up one receiver
    pub async fn get(&self, id: &ReceiverId) -> Option<Receiver> {
        self.inner.read().await.receivers.get(id).cloned()
    }

    /// List receivers, optionally filtering to available ones
    pub async fn list(&self, filter_available: bool) -> Vec<Receiver> {
        let inner = self.inner.read().await;
        let mut receivers: Vec<Receiver> = inner
            .receivers
            .values()
            .filter(|r| !filter_available || r.is_available())
            .cloned()
            .collect();
        receivers.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        receivers
    }

    /// Receivers currently registered
    pub async fn len(&self) -> usize {
        self.inner.read().await.receivers.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.receivers.is_empty()
    }

    /// Aggregate counts: totals, by origin, and available receivers
    /// by kind
    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        let mut stats = RegistryStats::default();
        for receiver in inner.receivers.values() {
            stats.total += 1;
            match receiver.origin {
                ReceiverOrigin::Manual => stats.manual += 1,
                ReceiverOrigin::Discovered => stats.discovered += 1,
            }
            if receiver.is_available() {
                stats.available += 1;
                *stats.by_kind.entry(receiver.kind).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Set a receiver's status, emitting `StatusChanged` when it moved
    pub async fn set_status(
        &self,
        id: &ReceiverId,
        status: ReceiverStatus,
        reason: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let receiver = inner
            .receivers
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let old = receiver.status;
        if old == status {
            return Ok(());
        }
        receiver.status = status;
        receiver.status_reason = reason;
        let _ = self.events.send(RegistryEvent::StatusChanged {
            receiver: receiver.clone(),
            old,
        });
        Ok(())
    }

    /// Apply a discovery event
    pub async fn apply_discovery_event(&self, event: &DiscoveryEvent) {
        match event {
            DiscoveryEvent::Added(service) | DiscoveryEvent::Updated(service) => {
                self.add_discovered(service).await;
            }
            DiscoveryEvent::Removed { fullname } => {
                self.remove_by_fullname(fullname).await;
            }
        }
    }

    /// Run the periodic maintenance loop until the shutdown signal.
    ///
    /// Every 30 s each receiver is probed and flipped between
    /// `Disconnected` and `Discovered`; discovered receivers unseen for
    /// 300 s are evicted. Manual receivers are never evicted by
    /// liveness alone.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // first tick completes immediately
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.maintenance_pass(EVICT_AFTER).await;
                }
                _ = shutdown.recv() => {
                    tracing::debug!("registry maintenance stopped");
                    return;
                }
            }
        }
    }

    /// One maintenance sweep: probe everything, then evict stale
    /// discovered receivers.
    ///
    /// Probes run concurrently so a pass is bounded by the slowest
    /// single probe, never by the sum; a handful of powered-off
    /// receivers must not make the sweep overrun its 30 s cadence.
    pub async fn maintenance_pass(&self, evict_after: Duration) {
        // Snapshot under the read lock; probes happen lock-free
        let targets: Vec<(ReceiverId, Option<Ipv4Addr>, u16)> = {
            let inner = self.inner.read().await;
            inner
                .receivers
                .values()
                .map(|r| (r.id.clone(), r.address(), r.port))
                .collect()
        };

        let timeout = self.probe_timeout;
        let probes = targets.into_iter().filter_map(|(id, addr, port)| {
            let addr = addr?;
            Some(async move {
                let reachable = probe_endpoint(SocketAddr::from((addr, port)), timeout)
                    .await
                    .is_ok();
                (id, reachable)
            })
        });
        let results = futures::future::join_all(probes).await;

        for (id, reachable) in results {
            let current = self.get(&id).await.map(|r| r.status);
            match (current, reachable) {
                (Some(ReceiverStatus::Disconnected | ReceiverStatus::Error), true) => {
                    let _ = self.set_status(&id, ReceiverStatus::Discovered, None).await;
                }
                (Some(ReceiverStatus::Discovered | ReceiverStatus::Connecting), false) => {
                    let _ = self
                        .set_status(&id, ReceiverStatus::Disconnected, None)
                        .await;
                }
                _ => {}
            }
        }

        self.evict_stale(evict_after).await;
    }

    /// Evict discovered receivers whose last sighting is older than
    /// `evict_after`. Exposed separately so tests can force it.
    pub async fn evict_stale(&self, evict_after: Duration) {
        let stale: Vec<ReceiverId> = {
            let inner = self.inner.read().await;
            inner
                .receivers
                .values()
                .filter(|r| {
                    r.origin == ReceiverOrigin::Discovered && r.last_seen.elapsed() > evict_after
                })
                .map(|r| r.id.clone())
                .collect()
        };
        for id in stale {
            tracing::info!(id = %id, "evicting stale discovered receiver");
            let _ = self.remove(&id).await;
        }
    }
}

/// Probe a receiver endpoint: TCP connect, then a best-effort RTSP
/// OPTIONS exchange. Connect success alone counts as reachable since
/// many RAOP devices ignore requests outside a session; a parsed
/// response returns `Ok(true)`.
///
/// # Errors
///
/// Returns the connect error or timeout.
pub async fn probe_endpoint(addr: SocketAddr, timeout: Duration) -> std::io::Result<bool> {
    let connect = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;

    let mut stream = connect;
    let request = b"OPTIONS * RTSP/1.0\r\nCSeq: 0\r\n\r\n";
    if stream.write_all(request).await.is_err() {
        return Ok(false);
    }

    let mut buf = [0u8; 256];
    let responded = matches!(
        tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf)).await,
        Ok(Ok(n)) if n > 0 && buf.starts_with(b"RTSP/1.0")
    );
    Ok(responded)
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr, RegistryError> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| RegistryError::Unresolvable {
            host: host.to_string(),
            message: e.to_string(),
        })?;
    addrs
        .find_map(|a| match a {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| RegistryError::Unresolvable {
            host: host.to_string(),
            message: "no IPv4 address".to_string(),
        })
}

impl std::fmt::Debug for ReceiverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
