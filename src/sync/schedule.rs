//! The shared presentation schedule
//!
//! Every receiver shares one master clock `T0` and global delay; only
//! the per-device correction differs. The presentation time of frame
//! `f` on receiver `r` is `T0 + (f.seq - seq0) * frame_duration + D_r`.

use std::time::Duration;
use tokio::time::Instant;

/// Immutable schedule for one playback run.
///
/// A flush re-anchors by replacing the schedule, never by mutating it,
/// so egress tasks can hold it without locks.
#[derive(Debug, Clone)]
pub struct PresentationSchedule {
    t0: Instant,
    seq0: u64,
    frame_duration: Duration,
    global_delay: Duration,
}

impl PresentationSchedule {
    /// Anchor a schedule: `T0 = now + D_g`, frame `seq0` audible at `T0`
    #[must_use]
    pub fn anchor(now: Instant, global_delay: Duration, seq0: u64, frame_duration: Duration) -> Self {
        Self {
            t0: now + global_delay,
            seq0,
            frame_duration,
            global_delay,
        }
    }

    /// The master clock reference `T0`
    #[must_use]
    pub fn t0(&self) -> Instant {
        self.t0
    }

    /// First frame of the schedule
    #[must_use]
    pub fn seq0(&self) -> u64 {
        self.seq0
    }

    /// Duration of one frame
    #[must_use]
    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// The global delay this schedule was anchored with
    #[must_use]
    pub fn global_delay(&self) -> Duration {
        self.global_delay
    }

    /// Common presentation term for a frame (before per-device delay).
    ///
    /// Frames before `seq0` map onto `T0`.
    #[must_use]
    pub fn presentation_time(&self, seq: u64) -> Instant {
        let steps = seq.saturating_sub(self.seq0);
        self.t0 + mul_duration(self.frame_duration, steps)
    }

    /// Presentation time on a specific receiver: the common term plus
    /// its device delay
    #[must_use]
    pub fn presentation_time_for(&self, seq: u64, device_delay: Duration) -> Instant {
        self.presentation_time(seq) + device_delay
    }

    /// First frame whose common presentation term is at or after
    /// `deadline`; used for join-during-playback boundaries.
    #[must_use]
    pub fn first_seq_at_or_after(&self, deadline: Instant) -> u64 {
        if deadline <= self.t0 {
            return self.seq0;
        }
        let elapsed = deadline - self.t0;
        let frame_nanos = self.frame_duration.as_nanos().max(1);
        let steps = elapsed.as_nanos().div_ceil(frame_nanos);
        self.seq0 + u64::try_from(steps).unwrap_or(u64::MAX)
    }
}

fn mul_duration(d: Duration, times: u64) -> Duration {
    Duration::from_nanos(
        u64::try_from(d.as_nanos().saturating_mul(u128::from(times)).min(u128::from(u64::MAX)))
            .unwrap_or(u64::MAX),
    )
}
