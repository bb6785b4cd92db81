//! Event stream offered to the outer shell

use crate::registry::{ReceiverRegistry, RegistryEvent};
use crate::stats::PlaybackState;
use crate::sync::{EngineEvent, EngineHandle};
use crate::types::{Receiver, ReceiverId, ReceiverStatus};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One entry on the control surface's event stream.
///
/// Serializes as `{"type": ..., "payload": ...}` so the shell can
/// forward entries to its WebSocket clients verbatim.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A receiver entered the registry
    DeviceAdded(Receiver),
    /// A receiver left the registry
    DeviceRemoved(Receiver),
    /// A receiver's record changed
    DeviceUpdated(Receiver),
    /// A receiver's status changed
    StatusChanged {
        /// The receiver after the change
        receiver: Receiver,
        /// Status before the change
        old: ReceiverStatus,
    },
    /// Playback state moved
    PlaybackStateChanged {
        /// The new state
        state: PlaybackState,
    },
    /// A receiver was evicted from the active group
    ReceiverEvicted {
        /// Which receiver
        id: ReceiverId,
        /// Why
        reason: String,
    },
}

/// Merge registry and engine events onto one ordered stream.
///
/// Ordering is total per receiver id because both sources publish
/// per-receiver changes from single-threaded owners.
pub fn spawn_event_pump(
    registry: &Arc<ReceiverRegistry>,
    engine: &EngineHandle,
    out: broadcast::Sender<ServerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut registry_events = registry.subscribe();
    let mut engine_events = engine.subscribe();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = registry_events.recv() => match event {
                    Ok(event) => map_registry_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "event pump lagged behind registry");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = engine_events.recv() => match event {
                    Ok(event) => map_engine_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "event pump lagged behind engine");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.recv() => break,
            };
            let _ = out.send(event);
        }
        tracing::debug!("event pump stopped");
    });
}

fn map_registry_event(event: RegistryEvent) -> ServerEvent {
    match event {
        RegistryEvent::Added(receiver) => ServerEvent::DeviceAdded(receiver),
        RegistryEvent::Updated(receiver) => ServerEvent::DeviceUpdated(receiver),
        RegistryEvent::Removed(receiver) => ServerEvent::DeviceRemoved(receiver),
        RegistryEvent::StatusChanged { receiver, old } => {
            ServerEvent::StatusChanged { receiver, old }
        }
    }
}

fn map_engine_event(event: EngineEvent) -> ServerEvent {
    match event {
        EngineEvent::PlaybackChanged(state) => ServerEvent::PlaybackStateChanged { state },
        EngineEvent::ReceiverEvicted { id, reason } => ServerEvent::ReceiverEvicted { id, reason },
    }
}

/// Convenience: current playback state as an event (sent to new
/// subscribers by the shell if it wants a snapshot-first protocol)
#[must_use]
pub fn playback_snapshot(state: PlaybackState) -> ServerEvent {
    ServerEvent::PlaybackStateChanged { state }
}
