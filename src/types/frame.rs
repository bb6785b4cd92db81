//! The unit of audio flowing from the terminator to the fan-out buffer

use bytes::Bytes;

/// One block of decoded PCM with its position in the stream.
///
/// Sequence numbers are contiguous per session: a lost RTP packet is
/// replaced by a silence frame of the same sample count before
/// publication, so consumers never observe a gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Monotonically increasing frame number, `seq(i+1) = seq(i) + 1`
    pub seq: u64,
    /// Sender RTP timestamp, extended from 32 to 64 bits
    pub timestamp: u64,
    /// Interleaved 16-bit little-endian PCM
    pub pcm: Bytes,
    /// Samples per channel in this frame
    pub sample_count: u32,
}

impl AudioFrame {
    /// Build a silence frame standing in for a lost packet
    #[must_use]
    pub fn silence(seq: u64, timestamp: u64, sample_count: u32, channels: u8) -> Self {
        let len = sample_count as usize * usize::from(channels) * 2;
        Self {
            seq,
            timestamp,
            pcm: Bytes::from(vec![0u8; len]),
            sample_count,
        }
    }

    /// Whether every sample in the frame is zero
    #[must_use]
    pub fn is_silence(&self) -> bool {
        self.pcm.iter().all(|&b| b == 0)
    }
}
