//! Control-channel frames exchanged with downstream receivers
//!
//! Two kinds of traffic share the control port: RAOP sync packets
//! (PT 0x54) that reassert the RTP-timestamp ↔ wall-clock mapping, and
//! playback command frames (PT 0x57) carrying start/stop/flush with
//! their scheduling parameters.

use super::packet::RtpDecodeError;
use super::timing::NtpTimestamp;

/// Playback commands broadcast to the active group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackCommand {
    /// Begin presentation at the given NTP instant
    Start {
        /// Presentation start on the wall clock
        start_at: NtpTimestamp,
        /// First frame number of the schedule
        start_seq: u64,
    },
    /// Stop presentation and drain
    Stop,
    /// Discard queued audio; frames before `next_seq` are stale
    Flush {
        /// First frame number that remains valid
        next_seq: u64,
    },
}

/// A decoded control-channel frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPacket {
    /// Sync packet: maps an RTP timestamp onto the wall clock
    Sync {
        /// RTP timestamp now playing
        rtp_timestamp: u32,
        /// Wall-clock moment that timestamp should be audible
        ntp_time: NtpTimestamp,
        /// RTP timestamp of the next packet to be sent
        next_timestamp: u32,
    },
    /// Playback command frame
    Command(PlaybackCommand),
}

impl ControlPacket {
    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self, sequence: u16) -> Vec<u8> {
        match *self {
            ControlPacket::Sync {
                rtp_timestamp,
                ntp_time,
                next_timestamp,
            } => {
                let mut buf = Vec::with_capacity(20);
                buf.push(0x80);
                buf.push(0xD4); // marker | PT 0x54
                buf.extend_from_slice(&sequence.to_be_bytes());
                buf.extend_from_slice(&rtp_timestamp.to_be_bytes());
                buf.extend_from_slice(&ntp_time.encode());
                buf.extend_from_slice(&next_timestamp.to_be_bytes());
                buf
            }
            ControlPacket::Command(cmd) => {
                let mut buf = Vec::with_capacity(24);
                buf.push(0x80);
                buf.push(0xD7); // marker | PT 0x57
                buf.extend_from_slice(&sequence.to_be_bytes());
                match cmd {
                    PlaybackCommand::Start {
                        start_at,
                        start_seq,
                    } => {
                        buf.push(0x01);
                        buf.extend_from_slice(&[0u8; 3]);
                        buf.extend_from_slice(&start_at.encode());
                        buf.extend_from_slice(&start_seq.to_be_bytes());
                    }
                    PlaybackCommand::Stop => {
                        buf.push(0x02);
                        buf.extend_from_slice(&[0u8; 3]);
                    }
                    PlaybackCommand::Flush { next_seq } => {
                        buf.push(0x03);
                        buf.extend_from_slice(&[0u8; 3]);
                        buf.extend_from_slice(&next_seq.to_be_bytes());
                    }
                }
                buf
            }
        }
    }

    /// Decode a control-channel frame.
    ///
    /// # Errors
    ///
    /// Returns [`RtpDecodeError`] on truncation or an unknown payload
    /// type / command byte.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < 4 {
            return Err(RtpDecodeError::Truncated {
                needed: 4,
                have: buf.len(),
            });
        }

        match buf[1] & 0x7F {
            0x54 => {
                if buf.len() < 20 {
                    return Err(RtpDecodeError::Truncated {
                        needed: 20,
                        have: buf.len(),
                    });
                }
                let mut ntp = [0u8; 8];
                ntp.copy_from_slice(&buf[8..16]);
                Ok(ControlPacket::Sync {
                    rtp_timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
                    ntp_time: NtpTimestamp::decode(&ntp),
                    next_timestamp: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
                })
            }
            0x57 => {
                if buf.len() < 8 {
                    return Err(RtpDecodeError::Truncated {
                        needed: 8,
                        have: buf.len(),
                    });
                }
                match buf[4] {
                    0x01 => {
                        if buf.len() < 24 {
                            return Err(RtpDecodeError::Truncated {
                                needed: 24,
                                have: buf.len(),
                            });
                        }
                        let mut ntp = [0u8; 8];
                        ntp.copy_from_slice(&buf[8..16]);
                        let mut seq = [0u8; 8];
                        seq.copy_from_slice(&buf[16..24]);
                        Ok(ControlPacket::Command(PlaybackCommand::Start {
                            start_at: NtpTimestamp::decode(&ntp),
                            start_seq: u64::from_be_bytes(seq),
                        }))
                    }
                    0x02 => Ok(ControlPacket::Command(PlaybackCommand::Stop)),
                    0x03 => {
                        if buf.len() < 16 {
                            return Err(RtpDecodeError::Truncated {
                                needed: 16,
                                have: buf.len(),
                            });
                        }
                        let mut seq = [0u8; 8];
                        seq.copy_from_slice(&buf[8..16]);
                        Ok(ControlPacket::Command(PlaybackCommand::Flush {
                            next_seq: u64::from_be_bytes(seq),
                        }))
                    }
                    other => Err(RtpDecodeError::UnknownCommand(other)),
                }
            }
            other => Err(RtpDecodeError::UnknownPayloadType(other)),
        }
    }
}
