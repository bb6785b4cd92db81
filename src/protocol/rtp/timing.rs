//! NTP-style timing exchange used to estimate per-receiver network delay

use super::packet::RtpDecodeError;

/// 64-bit NTP timestamp: seconds since 1900 plus binary fraction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpTimestamp {
    /// Whole seconds since the NTP epoch
    pub seconds: u32,
    /// Fractional seconds in units of 1/2^32
    pub fraction: u32,
}

impl NtpTimestamp {
    const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

    /// Capture the current wall clock
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: (since_epoch.as_secs() + Self::NTP_UNIX_OFFSET) as u32,
            fraction: ((u64::from(since_epoch.subsec_nanos()) << 32) / 1_000_000_000) as u32,
        }
    }

    /// Encode as 8 big-endian bytes
    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        buf[4..8].copy_from_slice(&self.fraction.to_be_bytes());
        buf
    }

    /// Decode from 8 big-endian bytes
    #[must_use]
    pub fn decode(buf: &[u8; 8]) -> Self {
        Self {
            seconds: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            fraction: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Microseconds since the NTP epoch
    #[must_use]
    pub fn as_micros(&self) -> u64 {
        u64::from(self.seconds) * 1_000_000 + ((u64::from(self.fraction) * 1_000_000) >> 32)
    }
}

/// Timing request, sent by us to a receiver's control port.
///
/// 32 bytes: an RTP-style header followed by reference/receive/send
/// timestamps (receive is zero in requests).
#[derive(Debug, Clone, Copy)]
pub struct TimingRequest {
    /// When the request left us
    pub send_time: NtpTimestamp,
}

impl TimingRequest {
    /// Encoded size including header
    pub const SIZE: usize = 32;

    /// Stamp a request with the current clock
    #[must_use]
    pub fn now() -> Self {
        Self {
            send_time: NtpTimestamp::now(),
        }
    }

    /// Encode with the given sequence number
    #[must_use]
    pub fn encode(&self, sequence: u16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(0x80);
        buf.push(0xD2); // marker | PT 0x52
        buf.extend_from_slice(&sequence.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]); // unused timestamp slot
        buf.extend_from_slice(&[0u8; 8]); // reference (unused)
        buf.extend_from_slice(&[0u8; 8]); // receive (zero in request)
        buf.extend_from_slice(&self.send_time.encode());
        buf
    }
}

/// Timing response from a receiver
#[derive(Debug, Clone, Copy)]
pub struct TimingResponse {
    /// Our original send time, echoed back
    pub origin_time: NtpTimestamp,
    /// When the receiver saw the request
    pub receive_time: NtpTimestamp,
    /// When the receiver answered
    pub send_time: NtpTimestamp,
}

impl TimingResponse {
    /// Encoded size including header
    pub const SIZE: usize = 32;

    /// Decode a response packet (header included).
    ///
    /// # Errors
    ///
    /// Returns [`RtpDecodeError::Truncated`] on a short buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < Self::SIZE {
            return Err(RtpDecodeError::Truncated {
                needed: Self::SIZE,
                have: buf.len(),
            });
        }
        let ts = |range: std::ops::Range<usize>| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[range]);
            NtpTimestamp::decode(&bytes)
        };
        Ok(Self {
            origin_time: ts(8..16),
            receive_time: ts(16..24),
            send_time: ts(24..32),
        })
    }

    /// Encode a response echoing `origin` (used when answering a
    /// sender's timing request and by tests standing in for receivers)
    #[must_use]
    pub fn encode(&self, sequence: u16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(0x80);
        buf.push(0xD3); // marker | PT 0x53
        buf.extend_from_slice(&sequence.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.origin_time.encode());
        buf.extend_from_slice(&self.receive_time.encode());
        buf.extend_from_slice(&self.send_time.encode());
        buf
    }

    /// Round-trip time, with the receiver's processing time removed
    #[must_use]
    pub fn round_trip(&self, arrival: NtpTimestamp) -> std::time::Duration {
        let t1 = self.origin_time.as_micros();
        let t2 = self.receive_time.as_micros();
        let t3 = self.send_time.as_micros();
        let t4 = arrival.as_micros();
        let rtt = t4.saturating_sub(t1).saturating_sub(t3.saturating_sub(t2));
        std::time::Duration::from_micros(rtt)
    }

    /// Clock offset estimate `((t2 - t1) + (t3 - t4)) / 2` in microseconds
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn clock_offset(&self, arrival: NtpTimestamp) -> i64 {
        let t1 = self.origin_time.as_micros() as i64;
        let t2 = self.receive_time.as_micros() as i64;
        let t3 = self.send_time.as_micros() as i64;
        let t4 = arrival.as_micros() as i64;
        ((t2 - t1) + (t3 - t4)) / 2
    }
}
