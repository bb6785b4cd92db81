//! RTP reordering, loss detection and timestamp extension
//!
//! Packets may arrive out of order; a short hold-back window gives
//! stragglers a chance before the gap is declared lost and filled with
//! silence. Sequence math is wrap-aware throughout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long an out-of-order packet may be awaited
pub const REORDER_WINDOW: Duration = Duration::from_millis(100);

/// Packets further ahead than this are treated as a stream reset
const MAX_AHEAD: u16 = 1024;

/// One in-order intake item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeItem {
    /// A received packet, released in order
    Packet {
        /// RTP sequence number
        seq: u16,
        /// RTP timestamp
        timestamp: u32,
        /// Raw payload
        payload: Vec<u8>,
    },
    /// A packet declared lost; the caller substitutes silence
    Lost {
        /// RTP sequence number that never arrived
        seq: u16,
    },
}

#[derive(Debug)]
struct Pending {
    timestamp: u32,
    payload: Vec<u8>,
    arrived: Instant,
}

/// Wrap-aware reorder window over 16-bit RTP sequence numbers
#[derive(Debug)]
pub struct ReorderWindow {
    expected: Option<u16>,
    pending: HashMap<u16, Pending>,
    window: Duration,
    duplicates: u64,
    lost: u64,
}

impl ReorderWindow {
    /// Create with the standard 100 ms window
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(REORDER_WINDOW)
    }

    /// Create with a custom window (tests use a short one)
    #[must_use]
    pub fn with_window(window: Duration) -> Self {
        Self {
            expected: None,
            pending: HashMap::new(),
            window,
            duplicates: 0,
            lost: 0,
        }
    }

    /// Total packets declared lost
    #[must_use]
    pub fn lost_count(&self) -> u64 {
        self.lost
    }

    /// Total duplicates or stale arrivals dropped
    #[must_use]
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates
    }

    /// Reset the sequence expectation (FLUSH), discarding held packets
    pub fn reset_to(&mut self, seq: u16) {
        self.pending.clear();
        self.expected = Some(seq);
    }

    /// Offer a packet; returns items now releasable in order
    pub fn push(&mut self, seq: u16, timestamp: u32, payload: Vec<u8>, now: Instant) -> Vec<IntakeItem> {
        let Some(expected) = self.expected else {
            // First packet anchors the sequence
            self.expected = Some(seq.wrapping_add(1));
            return vec![IntakeItem::Packet {
                seq,
                timestamp,
                payload,
            }];
        };

        let offset = seq.wrapping_sub(expected);
        if offset == 0 {
            let mut out = vec![IntakeItem::Packet {
                seq,
                timestamp,
                payload,
            }];
            self.expected = Some(seq.wrapping_add(1));
            self.release_consecutive(&mut out);
            out
        } else if offset < MAX_AHEAD {
            self.pending.insert(
                seq,
                Pending {
                    timestamp,
                    payload,
                    arrived: now,
                },
            );
            // An overdue head may already be releasable
            self.poll(now)
        } else {
            // Behind the cursor: duplicate or late beyond recovery
            self.duplicates += 1;
            Vec::new()
        }
    }

    /// Release items whose hold-back window expired.
    ///
    /// When the oldest held packet has waited the full window, every
    /// missing sequence before it is declared lost.
    pub fn poll(&mut self, now: Instant) -> Vec<IntakeItem> {
        let mut out = Vec::new();
        loop {
            let Some(expected) = self.expected else { break };
            if self.pending.is_empty() {
                break;
            }

            // Oldest pending by wrap-aware distance from the cursor
            let (&head_seq, head) = self
                .pending
                .iter()
                .min_by_key(|(seq, _)| seq.wrapping_sub(expected))
                .expect("pending not empty");

            if now.duration_since(head.arrived) < self.window {
                break;
            }

            let gap = head_seq.wrapping_sub(expected);
            let mut seq = expected;
            for _ in 0..gap {
                self.lost += 1;
                out.push(IntakeItem::Lost { seq });
                seq = seq.wrapping_add(1);
            }
            let head = self.pending.remove(&head_seq).expect("head exists");
            out.push(IntakeItem::Packet {
                seq: head_seq,
                timestamp: head.timestamp,
                payload: head.payload,
            });
            self.expected = Some(head_seq.wrapping_add(1));
            self.release_consecutive(&mut out);
        }
        out
    }

    fn release_consecutive(&mut self, out: &mut Vec<IntakeItem>) {
        while let Some(expected) = self.expected {
            let Some(next) = self.pending.remove(&expected) else {
                break;
            };
            out.push(IntakeItem::Packet {
                seq: expected,
                timestamp: next.timestamp,
                payload: next.payload,
            });
            self.expected = Some(expected.wrapping_add(1));
        }
    }
}

impl Default for ReorderWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Extends 32-bit RTP timestamps to a monotonic 64-bit domain
#[derive(Debug, Default)]
pub struct TimestampExtender {
    last: Option<u32>,
    epoch: u64,
}

impl TimestampExtender {
    /// Create with no history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend one timestamp, detecting 32-bit wraps
    pub fn extend(&mut self, timestamp: u32) -> u64 {
        if let Some(last) = self.last {
            // A large backwards jump is a wrap, not reordering
            if timestamp < last && last - timestamp > u32::MAX / 2 {
                self.epoch += 1;
            }
        }
        self.last = Some(timestamp);
        (self.epoch << 32) | u64::from(timestamp)
    }
}
