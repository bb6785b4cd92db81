//! Per-receiver delay `D_r`
//!
//! The correction added to every presentation time for one receiver:
//! a configured base delay, a measured network delay, and an operator
//! calibration knob. Network measurements are low-pass filtered so one
//! noisy RTT sample cannot jolt playback.

use std::time::Duration;

/// Filter constant: new sample contributes 1/8 (NTP-style)
const FILTER_SHIFT: u32 = 3;

/// Components of a receiver's delay correction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceDelay {
    base: Duration,
    network: Duration,
    calibration: Duration,
}

impl DeviceDelay {
    /// Create with a configured base delay
    #[must_use]
    pub fn with_base(base: Duration) -> Self {
        Self {
            base,
            ..Default::default()
        }
    }

    /// Total correction `D_r`
    #[must_use]
    pub fn total(&self) -> Duration {
        self.base + self.network + self.calibration
    }

    /// Configured base delay
    #[must_use]
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Filtered network delay
    #[must_use]
    pub fn network(&self) -> Duration {
        self.network
    }

    /// Operator calibration offset
    #[must_use]
    pub fn calibration(&self) -> Duration {
        self.calibration
    }

    /// Set the calibration knob
    pub fn set_calibration(&mut self, calibration: Duration) {
        self.calibration = calibration;
    }

    /// Fold in a new RTT measurement (one-way = RTT/2).
    ///
    /// Returns true when the filtered value moved.
    pub fn update_from_rtt(&mut self, rtt: Duration) -> bool {
        let sample = rtt / 2;
        let old = self.network;
        if old.is_zero() {
            self.network = sample;
        } else {
            // network += (sample - network) / 8, in nanoseconds
            let old_ns = i128::from(old.as_nanos() as u64);
            let sample_ns = i128::from(sample.as_nanos() as u64);
            let next = old_ns + ((sample_ns - old_ns) >> FILTER_SHIFT);
            self.network = Duration::from_nanos(u64::try_from(next.max(0)).unwrap_or(0));
        }
        self.network != old
    }
}
