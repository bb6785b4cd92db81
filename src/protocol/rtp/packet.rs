//! RTP audio packet encode/decode

/// RTP payload types seen on RAOP audio and control ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    /// Timing request
    TimingRequest = 0x52,
    /// Timing response
    TimingResponse = 0x53,
    /// Sender sync packet
    Sync = 0x54,
    /// Retransmit request
    RetransmitRequest = 0x55,
    /// Retransmit response
    RetransmitResponse = 0x56,
    /// Playback command frame (this server's downstream control framing)
    Command = 0x57,
    /// Realtime audio
    Audio = 0x60,
}

impl PayloadType {
    /// Parse from the masked payload-type byte
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x7F {
            0x52 => Some(Self::TimingRequest),
            0x53 => Some(Self::TimingResponse),
            0x54 => Some(Self::Sync),
            0x55 => Some(Self::RetransmitRequest),
            0x56 => Some(Self::RetransmitResponse),
            0x57 => Some(Self::Command),
            0x60 => Some(Self::Audio),
            _ => None,
        }
    }
}

/// Standard 12-byte RTP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Protocol version, always 2
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// Marker bit (set on the first packet of a stream)
    pub marker: bool,
    /// Payload type
    pub payload_type: PayloadType,
    /// 16-bit sequence number
    pub sequence: u16,
    /// 32-bit media timestamp
    pub timestamp: u32,
    /// Synchronization source
    pub ssrc: u32,
}

impl RtpHeader {
    /// Encoded header size
    pub const SIZE: usize = 12;

    /// Header for an outgoing audio packet
    #[must_use]
    pub fn audio(sequence: u16, timestamp: u32, ssrc: u32, first: bool) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            marker: first,
            payload_type: PayloadType::Audio,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = (self.version << 6)
            | (u8::from(self.padding) << 5)
            | (u8::from(self.extension) << 4);
        buf[1] = (u8::from(self.marker) << 7) | (self.payload_type as u8 & 0x7F);
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RtpDecodeError`] when the buffer is short, the version
    /// is wrong, or the payload type is unknown.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < Self::SIZE {
            return Err(RtpDecodeError::Truncated {
                needed: Self::SIZE,
                have: buf.len(),
            });
        }
        let version = buf[0] >> 6;
        if version != 2 {
            return Err(RtpDecodeError::BadVersion(version));
        }
        let pt_byte = buf[1] & 0x7F;
        let payload_type =
            PayloadType::from_byte(pt_byte).ok_or(RtpDecodeError::UnknownPayloadType(pt_byte))?;

        Ok(Self {
            version,
            padding: buf[0] & 0x20 != 0,
            extension: buf[0] & 0x10 != 0,
            marker: buf[1] & 0x80 != 0,
            payload_type,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

/// RTP decode failures
#[derive(Debug, thiserror::Error)]
pub enum RtpDecodeError {
    /// Buffer shorter than the structure demands
    #[error("truncated packet: need {needed} bytes, have {have}")]
    Truncated {
        /// Minimum required length
        needed: usize,
        /// Observed length
        have: usize,
    },

    /// Version field was not 2
    #[error("bad RTP version {0}")]
    BadVersion(u8),

    /// Payload type not in our set
    #[error("unknown payload type 0x{0:02x}")]
    UnknownPayloadType(u8),

    /// Control frame command byte not in our set
    #[error("unknown command 0x{0:02x}")]
    UnknownCommand(u8),
}

/// Header plus payload
#[derive(Debug, Clone)]
pub struct RtpPacket {
    /// Packet header
    pub header: RtpHeader,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Build an audio packet
    #[must_use]
    pub fn audio(sequence: u16, timestamp: u32, ssrc: u32, pcm: Vec<u8>) -> Self {
        Self {
            header: RtpHeader::audio(sequence, timestamp, ssrc, sequence == 0),
            payload: pcm,
        }
    }

    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RtpHeader::SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RtpDecodeError`] on a malformed header.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        let header = RtpHeader::decode(buf)?;
        Ok(Self {
            header,
            payload: buf[RtpHeader::SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_header_round_trip() {
        let header = RtpHeader::audio(1234, 0xDEAD_BEEF, 0x1122_3344, false);
        let decoded = RtpHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn first_packet_sets_marker() {
        let p = RtpPacket::audio(0, 0, 1, vec![0; 4]);
        assert!(p.header.marker);
        let p = RtpPacket::audio(1, 352, 1, vec![0; 4]);
        assert!(!p.header.marker);
    }

    #[test]
    fn packet_round_trip_preserves_payload() {
        let payload: Vec<u8> = (0..64).collect();
        let p = RtpPacket::audio(7, 352 * 7, 42, payload.clone());
        let decoded = RtpPacket::decode(&p.encode()).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.header.sequence, 7);
        assert_eq!(decoded.header.timestamp, 352 * 7);
    }

    #[test]
    fn short_buffer_is_truncated() {
        assert!(matches!(
            RtpHeader::decode(&[0x80, 0x60, 0, 1]),
            Err(RtpDecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn version_other_than_two_is_rejected() {
        let mut bytes = RtpHeader::audio(0, 0, 0, false).encode();
        bytes[0] = 0x40; // version 1
        assert!(matches!(
            RtpHeader::decode(&bytes),
            Err(RtpDecodeError::BadVersion(1))
        ));
    }

    #[test]
    fn unknown_payload_type_is_rejected() {
        let mut bytes = RtpHeader::audio(0, 0, 0, false).encode();
        bytes[1] = 0x7F;
        assert!(matches!(
            RtpHeader::decode(&bytes),
            Err(RtpDecodeError::UnknownPayloadType(0x7F))
        ));
    }
}
