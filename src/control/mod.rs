//! Control surface exposed to the outer shell
//!
//! Every operation is idempotent and takes/returns serde-serializable
//! values, so the HTTP/WebSocket shell can stay a thin translation
//! layer. Errors are structured; the shell maps [`ControlError::kind`]
//! onto its own status codes.

pub mod events;

pub use events::{ServerEvent, spawn_event_pump};

use crate::registry::{ReceiverRegistry, RegistryError, RegistryStats};
use crate::stats::{ServerStats, StatsSnapshot};
use crate::sync::{EngineError, EngineHandle};
use crate::types::{Receiver, ReceiverId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Control operation failures
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Unknown receiver id
    #[error("receiver not found: {0}")]
    NotFound(ReceiverId),

    /// The receiver cannot join the active group
    #[error("receiver incompatible: {0}")]
    Incompatible(String),

    /// `start_playback` without a sender stream
    #[error("no active stream")]
    NoActiveStream,

    /// Request was malformed (bad host, empty name)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal machinery unavailable (engine stopped)
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Stable error discriminator for the shell's wire mapping
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::NotFound(_) => "not_found",
            ControlError::Incompatible(_) => "incompatible",
            ControlError::NoActiveStream => "no_active_stream",
            ControlError::InvalidRequest(_) => "invalid_request",
            ControlError::Internal(_) => "internal",
        }
    }
}

/// `get_stats` payload: runtime counters plus the registry breakdown
#[derive(Debug, Clone, Serialize)]
pub struct ControlStats {
    /// Runtime counters
    #[serde(flatten)]
    pub runtime: StatsSnapshot,
    /// Registry counts: totals, by origin, available by kind
    pub receivers: RegistryStats,
}

/// `add_manual_receiver` request body
#[derive(Debug, Clone, Deserialize)]
pub struct AddManualReceiver {
    /// IPv4 address or hostname
    pub host: String,
    /// RTSP port; defaults to 7000
    #[serde(default)]
    pub port: Option<u16>,
    /// Display name
    pub name: String,
}

/// The control surface
#[derive(Clone)]
pub struct ControlSurface {
    registry: Arc<ReceiverRegistry>,
    engine: EngineHandle,
    stats: Arc<ServerStats>,
    events: broadcast::Sender<ServerEvent>,
}

impl ControlSurface {
    /// Assemble the surface and start its event pump
    #[must_use]
    pub fn new(
        registry: Arc<ReceiverRegistry>,
        engine: EngineHandle,
        stats: Arc<ServerStats>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (events, _) = broadcast::channel(128);
        spawn_event_pump(&registry, &engine, events.clone(), shutdown);
        Self {
            registry,
            engine,
            stats,
            events,
        }
    }

    /// List receivers; `include_unavailable` keeps errored and
    /// disconnected entries in the result
    pub async fn list_receivers(&self, include_unavailable: bool) -> Vec<Receiver> {
        self.registry.list(!include_unavailable).await
    }

    /// Register a manual receiver.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidRequest`] on an empty name or an
    /// unresolvable host.
    pub async fn add_manual_receiver(
        &self,
        request: AddManualReceiver,
    ) -> Result<ReceiverId, ControlError> {
        if request.name.trim().is_empty() {
            return Err(ControlError::InvalidRequest("name must not be empty".into()));
        }
        let port = request.port.unwrap_or(7000);
        self.registry
            .add_manual(request.name.trim(), &request.host, port)
            .await
            .map_err(|e| match e {
                RegistryError::Unresolvable { .. } => ControlError::InvalidRequest(e.to_string()),
                RegistryError::NotFound(id) => ControlError::NotFound(id),
            })
    }

    /// Remove a receiver.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for unknown ids.
    pub async fn remove_receiver(&self, id: &ReceiverId) -> Result<(), ControlError> {
        // Make sure the sync engine lets go first
        self.engine.leave(id.clone()).await;
        self.registry.remove(id).await.map_err(|e| match e {
            RegistryError::NotFound(id) => ControlError::NotFound(id),
            other => ControlError::Internal(other.to_string()),
        })
    }

    /// Add a receiver to the active group; repeated joins are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] or
    /// [`ControlError::Incompatible`].
    pub async fn join_group(&self, id: &ReceiverId) -> Result<(), ControlError> {
        self.engine.join(id.clone()).await.map_err(|e| match e {
            EngineError::NotFound(id) => ControlError::NotFound(id),
            EngineError::Incompatible { reason, .. } => ControlError::Incompatible(reason),
            EngineError::NoActiveStream => ControlError::NoActiveStream,
            EngineError::Stopped => ControlError::Internal("engine stopped".into()),
        })
    }

    /// Remove a receiver from the active group; always succeeds
    pub async fn leave_group(&self, id: &ReceiverId) {
        self.engine.leave(id.clone()).await;
    }

    /// Start playback of the attached sender stream.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NoActiveStream`] when no sender is
    /// recording.
    pub async fn start_playback(&self) -> Result<(), ControlError> {
        self.engine.start_playback().await.map_err(|e| match e {
            EngineError::NoActiveStream => ControlError::NoActiveStream,
            other => ControlError::Internal(other.to_string()),
        })
    }

    /// Stop playback, keeping group membership
    pub async fn stop_playback(&self) {
        self.engine.stop_playback().await;
    }

    /// Point-in-time statistics
    pub async fn get_stats(&self) -> ControlStats {
        ControlStats {
            runtime: self.stats.snapshot(),
            receivers: self.registry.stats().await,
        }
    }

    /// Subscribe to the event stream
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}
