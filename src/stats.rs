//! Shared runtime counters backing `get_stats`

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Coarse playback state visible to the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// No schedule active
    #[default]
    Stopped,
    /// Frames are being scheduled to the group
    Playing,
    /// Sender paused the stream; the session is alive
    Paused,
}

/// Shared counters updated by every subsystem.
///
/// All counters are monotonic except `devices_connected`, which is a
/// gauge owned by the sync engine. Locks here are plain `std` locks held
/// only for copies, never across an await.
#[derive(Debug)]
pub struct ServerStats {
    started_at: Instant,
    frames_sent: AtomicU64,
    sync_corrections: AtomicU64,
    buffer_underruns: AtomicU64,
    decode_errors: AtomicU64,
    late_frames: AtomicU64,
    devices_connected: AtomicUsize,
    auto_discovery: AtomicBool,
    playback_state: RwLock<PlaybackState>,
}

impl ServerStats {
    /// Create zeroed stats anchored at now
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started_at: Instant::now(),
            frames_sent: AtomicU64::new(0),
            sync_corrections: AtomicU64::new(0),
            buffer_underruns: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            late_frames: AtomicU64::new(0),
            devices_connected: AtomicUsize::new(0),
            auto_discovery: AtomicBool::new(true),
            playback_state: RwLock::new(PlaybackState::Stopped),
        })
    }

    /// One frame transmitted to one receiver
    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// One per-receiver delay recomputation applied
    pub fn record_sync_correction(&self) {
        self.sync_corrections.fetch_add(1, Ordering::Relaxed);
    }

    /// A consumer lagged past the fan-out capacity
    pub fn record_buffer_underrun(&self) {
        self.buffer_underruns.fetch_add(1, Ordering::Relaxed);
    }

    /// A malformed audio payload was replaced with silence
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame missed its presentation deadline and was dropped
    pub fn record_late_frame(&self) {
        self.late_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Update the connected-receiver gauge
    pub fn set_devices_connected(&self, n: usize) {
        self.devices_connected.store(n, Ordering::Relaxed);
    }

    /// Record whether mDNS browsing is active
    pub fn set_auto_discovery(&self, enabled: bool) {
        self.auto_discovery.store(enabled, Ordering::Relaxed);
    }

    /// Update the coarse playback state
    pub fn set_playback_state(&self, state: PlaybackState) {
        *self.playback_state.write().expect("stats lock poisoned") = state;
    }

    /// Current playback state
    #[must_use]
    pub fn playback_state(&self) -> PlaybackState {
        *self.playback_state.read().expect("stats lock poisoned")
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            sync_corrections: self.sync_corrections.load(Ordering::Relaxed),
            buffer_underruns: self.buffer_underruns.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            late_frames: self.late_frames.load(Ordering::Relaxed),
            devices_connected: self.devices_connected.load(Ordering::Relaxed),
            auto_discovery: self.auto_discovery.load(Ordering::Relaxed),
            playback_state: self.playback_state(),
            uptime_s: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Serializable copy of [`ServerStats`]
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Frames transmitted across all receivers
    pub frames_sent: u64,
    /// Delay recomputations applied
    pub sync_corrections: u64,
    /// Fan-out consumer lag events
    pub buffer_underruns: u64,
    /// Audio payloads replaced with silence
    pub decode_errors: u64,
    /// Frames dropped for missing their deadline
    pub late_frames: u64,
    /// Receivers currently in the active group
    pub devices_connected: usize,
    /// Whether mDNS browsing is running
    pub auto_discovery: bool,
    /// Coarse playback state
    pub playback_state: PlaybackState,
    /// Seconds since server start
    pub uptime_s: u64,
}
