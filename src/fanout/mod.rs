//! Audio fan-out buffer
//!
//! Single-producer, multi-consumer bounded queue between the RAOP
//! terminator and the per-receiver egress tasks. Built on a broadcast
//! ring: the producer never blocks, each consumer has its own cursor,
//! and a consumer that lags past the ring capacity is skipped forward
//! to the newest frame and handed an explicit discontinuity marker.

use crate::stats::ServerStats;
use crate::types::AudioFrame;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Seconds of audio the buffer holds
const BUFFER_SECONDS: u64 = 2;

/// Compute the ring capacity in frames for ≈2 s of audio.
///
/// `2 * 44100 * 2 / 1024 = 172` for 1024-sample frames at 44.1 kHz
/// stereo.
#[must_use]
pub fn capacity_for(sample_rate: u32, channels: u8, samples_per_frame: u32) -> usize {
    let samples = BUFFER_SECONDS * u64::from(sample_rate) * u64::from(channels);
    let frames = samples / u64::from(samples_per_frame.max(1));
    usize::try_from(frames.max(1)).unwrap_or(1)
}

/// What a consumer observes on its tap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapItem {
    /// The next frame in sequence order
    Frame(AudioFrame),
    /// The consumer lagged and was skipped forward
    Discontinuity {
        /// How many frames were dropped for this consumer
        skipped: u64,
    },
}

/// Producer handle for the fan-out buffer
#[derive(Debug, Clone)]
pub struct FanoutBuffer {
    tx: broadcast::Sender<AudioFrame>,
    capacity: usize,
    stats: Arc<ServerStats>,
}

impl FanoutBuffer {
    /// Create a buffer with an explicit frame capacity
    #[must_use]
    pub fn new(capacity: usize, stats: Arc<ServerStats>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            capacity,
            stats,
        }
    }

    /// Create a buffer sized to ≈2 s of the given stream format
    #[must_use]
    pub fn for_format(
        sample_rate: u32,
        channels: u8,
        samples_per_frame: u32,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self::new(capacity_for(sample_rate, channels, samples_per_frame), stats)
    }

    /// Ring capacity in frames
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish a frame to every consumer; never blocks.
    ///
    /// Returns the number of consumers that will observe the frame.
    pub fn publish(&self, frame: AudioFrame) -> usize {
        self.tx.send(frame).unwrap_or(0)
    }

    /// Open a new consumer tap positioned at the next published frame
    #[must_use]
    pub fn tap(&self) -> FrameTap {
        FrameTap {
            rx: self.tx.subscribe(),
            stats: self.stats.clone(),
        }
    }

    /// Number of open taps
    #[must_use]
    pub fn tap_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One consumer's view of the fan-out buffer
pub struct FrameTap {
    rx: broadcast::Receiver<AudioFrame>,
    stats: Arc<ServerStats>,
}

impl FrameTap {
    /// Wait for the next item.
    ///
    /// Returns `None` once the producer is gone and the ring drained.
    /// A lagged consumer gets a [`TapItem::Discontinuity`] and is
    /// repositioned at the oldest retained frame; the underrun is
    /// counted in stats.
    pub async fn next(&mut self) -> Option<TapItem> {
        match self.rx.recv().await {
            Ok(frame) => Some(TapItem::Frame(frame)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                self.stats.record_buffer_underrun();
                tracing::warn!(skipped, "fan-out consumer lagged, skipping forward");
                Some(TapItem::Discontinuity { skipped })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Drop everything queued on this tap, repositioning at the next
    /// publish. Used on flush.
    pub fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => break,
            }
        }
    }
}
