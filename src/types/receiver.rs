//! Downstream receiver records

use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

/// Stable identifier for a receiver, derived from `{host, port}`.
///
/// The id never changes after creation, even when the receiver is
/// re-discovered or its TXT records are updated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ReceiverId(String);

impl ReceiverId {
    /// Derive the id from host and RTSP port
    #[must_use]
    pub fn from_endpoint(host: Ipv4Addr, port: u16) -> Self {
        Self(format!("{host}:{port}"))
    }

    /// Wrap an already-formed id string
    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get as string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a receiver entered the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverOrigin {
    /// Found via mDNS browsing
    Discovered,
    /// Configured by the operator
    Manual,
}

/// Receiver lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverStatus {
    /// Seen on the network, not yet attached
    Discovered,
    /// Egress attachment in progress
    Connecting,
    /// Actively part of a playback group
    Connected,
    /// Liveness probe failed
    Disconnected,
    /// Faulted (probe failure on a manual receiver, skew eviction, ...)
    Error,
}

/// What kind of endpoint a discovered service looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Plain audio receiver (`_raop._tcp` or audio-only `_airplay._tcp`)
    AudioReceiver,
    /// Video-capable AirPlay target; still used as an audio receiver
    VideoCapable,
    /// AirPort Express
    AirportExpress,
    /// Unclassified service; registered anyway
    Unknown,
}

/// A downstream AirPlay audio endpoint known to the registry
#[derive(Debug, Clone, Serialize)]
pub struct Receiver {
    /// Stable identity (see [`ReceiverId`])
    pub id: ReceiverId,
    /// Human-readable name
    pub name: String,
    /// Origin tag
    pub origin: ReceiverOrigin,
    /// Classified endpoint kind
    pub kind: DeviceKind,
    /// Resolved IPv4 addresses; the first entry is preferred
    pub addresses: Vec<Ipv4Addr>,
    /// RTSP port
    pub port: u16,
    /// Model string from the `am` TXT record
    pub model: Option<String>,
    /// Firmware string from the `fv` TXT record
    pub firmware: Option<String>,
    /// Feature bitmap from the `ft` TXT record
    pub features: Option<u64>,
    /// Current status
    pub status: ReceiverStatus,
    /// Why the receiver is in `Error`, when it is
    pub status_reason: Option<String>,
    /// Raw TXT records as observed
    pub txt_records: HashMap<String, String>,
    /// Last sighting on the monotonic clock
    #[serde(skip)]
    pub last_seen: Instant,
}

impl Receiver {
    /// Create a manually configured receiver
    #[must_use]
    pub fn manual(name: impl Into<String>, host: Ipv4Addr, port: u16) -> Self {
        Self {
            id: ReceiverId::from_endpoint(host, port),
            name: name.into(),
            origin: ReceiverOrigin::Manual,
            kind: DeviceKind::Unknown,
            addresses: vec![host],
            port,
            model: None,
            firmware: None,
            features: None,
            status: ReceiverStatus::Discovered,
            status_reason: None,
            txt_records: HashMap::new(),
            last_seen: Instant::now(),
        }
    }

    /// Primary address for this receiver
    #[must_use]
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.addresses.first().copied()
    }

    /// Whether the receiver can currently be offered to the sync engine
    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(
            self.status,
            ReceiverStatus::Disconnected | ReceiverStatus::Error
        )
    }

    /// Record a fresh sighting
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}
