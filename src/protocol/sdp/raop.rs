//! RAOP stream format extraction from ANNOUNCE SDP

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::{MediaDescription, SdpParseError, SessionDescription};

/// Audio codec announced by the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    /// Uncompressed L16
    Pcm,
    /// Apple Lossless
    Alac,
}

/// ALAC parameters carried on the `fmtp` line.
///
/// Classic RAOP order:
/// `96 352 0 16 40 10 14 2 255 0 0 44100`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlacParameters {
    /// Samples per packet
    pub frames_per_packet: u32,
    /// ALAC compatible version
    pub compatible_version: u8,
    /// Bits per sample
    pub bit_depth: u8,
    /// Rice history multiplier
    pub pb: u8,
    /// Rice initial history
    pub mb: u8,
    /// Rice parameter limit
    pub kb: u8,
    /// Channel count
    pub channels: u8,
    /// Maximum run length
    pub max_run: u16,
    /// Maximum encoded frame size
    pub max_frame_bytes: u32,
    /// Average bit rate
    pub avg_bit_rate: u32,
    /// Sample rate
    pub sample_rate: u32,
}

impl AlacParameters {
    /// Parse an `fmtp` value; accepts the 12-field form (leading payload
    /// type) and the 11-field form some senders produce.
    ///
    /// # Errors
    ///
    /// Returns [`SdpParseError::InvalidAttribute`] on a missing or
    /// non-numeric field.
    pub fn parse(fmtp: &str) -> Result<Self, SdpParseError> {
        let parts: Vec<&str> = fmtp.split_whitespace().collect();
        let offset = match parts.len() {
            12 => 1,
            11 => 0,
            n => {
                return Err(SdpParseError::InvalidAttribute(format!(
                    "ALAC fmtp needs 11 or 12 fields, got {n}"
                )));
            }
        };

        fn field<T: std::str::FromStr>(
            parts: &[&str],
            index: usize,
            name: &str,
        ) -> Result<T, SdpParseError> {
            parts[index].parse().map_err(|_| {
                SdpParseError::InvalidAttribute(format!("bad {name}: {}", parts[index]))
            })
        }

        Ok(Self {
            frames_per_packet: field(&parts, offset, "frames_per_packet")?,
            compatible_version: field(&parts, offset + 1, "compatible_version")?,
            bit_depth: field(&parts, offset + 2, "bit_depth")?,
            pb: field(&parts, offset + 3, "pb")?,
            mb: field(&parts, offset + 4, "mb")?,
            kb: field(&parts, offset + 5, "kb")?,
            channels: field(&parts, offset + 6, "channels")?,
            max_run: field(&parts, offset + 7, "max_run")?,
            max_frame_bytes: field(&parts, offset + 8, "max_frame_bytes")?,
            avg_bit_rate: field(&parts, offset + 9, "avg_bit_rate")?,
            sample_rate: field(&parts, offset + 10, "sample_rate")?,
        })
    }

    /// Build the 24-byte `ALACSpecificConfig` magic cookie the decoder
    /// needs, all fields big-endian.
    #[must_use]
    pub fn magic_cookie(&self) -> Vec<u8> {
        let mut cookie = Vec::with_capacity(24);
        cookie.extend_from_slice(&self.frames_per_packet.to_be_bytes());
        cookie.push(self.compatible_version);
        cookie.push(self.bit_depth);
        cookie.push(self.pb);
        cookie.push(self.mb);
        cookie.push(self.kb);
        cookie.push(self.channels);
        cookie.extend_from_slice(&self.max_run.to_be_bytes());
        cookie.extend_from_slice(&self.max_frame_bytes.to_be_bytes());
        cookie.extend_from_slice(&self.avg_bit_rate.to_be_bytes());
        cookie.extend_from_slice(&self.sample_rate.to_be_bytes());
        cookie
    }
}

/// Encryption material announced in the SDP.
///
/// The AES key arrives RSA-wrapped; without Apple's private key it
/// cannot be unwrapped, so its presence makes the session unplayable
/// for this server (ANNOUNCE answers 401).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionParams {
    /// RSA-wrapped AES key, base64-decoded
    pub wrapped_aes_key: Vec<u8>,
    /// AES IV, base64-decoded
    pub aes_iv: [u8; 16],
}

/// Negotiated stream format for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    /// Announced codec
    pub codec: AudioCodec,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Bits per sample
    pub bit_depth: u8,
    /// Channel count
    pub channels: u8,
    /// Samples per RTP packet
    pub frames_per_packet: u32,
    /// ALAC parameters when the codec is ALAC
    pub alac: Option<AlacParameters>,
    /// Encryption material, when announced
    pub encryption: Option<EncryptionParams>,
    /// Sender-requested minimum latency in samples
    pub min_latency: Option<u32>,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Pcm,
            sample_rate: 44_100,
            bit_depth: 16,
            channels: 2,
            frames_per_packet: 352,
            alac: None,
            encryption: None,
            min_latency: None,
        }
    }
}

impl StreamFormat {
    /// Whether the sender announced encryption
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Duration of one packet's worth of audio
    #[must_use]
    pub fn packet_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(
            f64::from(self.frames_per_packet) / f64::from(self.sample_rate),
        )
    }

    /// Extract the stream format from a parsed ANNOUNCE SDP.
    ///
    /// # Errors
    ///
    /// Returns [`SdpParseError`] when the audio media section, rtpmap,
    /// or required codec parameters are missing or malformed.
    pub fn from_sdp(sdp: &SessionDescription) -> Result<Self, SdpParseError> {
        let media = sdp
            .audio_media()
            .ok_or(SdpParseError::MissingField("audio media"))?;

        let rtpmap = attr(media, "rtpmap").ok_or(SdpParseError::MissingField("rtpmap"))?;
        let codec = if rtpmap.contains("AppleLossless") {
            AudioCodec::Alac
        } else if rtpmap.contains("L16") {
            AudioCodec::Pcm
        } else {
            return Err(SdpParseError::InvalidAttribute(format!(
                "unsupported rtpmap: {rtpmap}"
            )));
        };

        let (alac, sample_rate, bit_depth, channels, frames_per_packet) = match codec {
            AudioCodec::Alac => {
                let fmtp = attr(media, "fmtp").ok_or(SdpParseError::MissingField("fmtp"))?;
                let alac = AlacParameters::parse(fmtp)?;
                (
                    Some(alac.clone()),
                    alac.sample_rate,
                    alac.bit_depth,
                    alac.channels,
                    alac.frames_per_packet,
                )
            }
            AudioCodec::Pcm => {
                // rtpmap "96 L16/44100/2" carries rate and channels
                let (rate, channels) = parse_l16_rtpmap(rtpmap);
                (None, rate, 16, channels, 352)
            }
        };

        let encryption = parse_encryption(media)?;
        let min_latency = attr(media, "min-latency").and_then(|s| s.trim().parse().ok());

        Ok(Self {
            codec,
            sample_rate,
            bit_depth,
            channels,
            frames_per_packet,
            alac,
            encryption,
            min_latency,
        })
    }
}

fn attr<'a>(media: &'a MediaDescription, name: &str) -> Option<&'a str> {
    media.attributes.get(name)?.as_deref()
}

fn parse_l16_rtpmap(rtpmap: &str) -> (u32, u8) {
    // "96 L16/44100/2" -> (44100, 2)
    let spec = rtpmap.split_whitespace().nth(1).unwrap_or(rtpmap);
    let mut parts = spec.split('/').skip(1);
    let rate = parts.next().and_then(|s| s.parse().ok()).unwrap_or(44_100);
    let channels = parts.next().and_then(|s| s.parse().ok()).unwrap_or(2);
    (rate, channels)
}

fn parse_encryption(media: &MediaDescription) -> Result<Option<EncryptionParams>, SdpParseError> {
    let Some(key_b64) = attr(media, "rsaaeskey") else {
        return Ok(None);
    };
    let iv_b64 = attr(media, "aesiv").ok_or(SdpParseError::MissingField("aesiv"))?;

    let wrapped_aes_key = BASE64
        .decode(key_b64.trim())
        .map_err(|_| SdpParseError::InvalidAttribute("bad base64 in rsaaeskey".to_string()))?;
    let iv_bytes = BASE64
        .decode(iv_b64.trim())
        .map_err(|_| SdpParseError::InvalidAttribute("bad base64 in aesiv".to_string()))?;

    let aes_iv: [u8; 16] = iv_bytes.try_into().map_err(|v: Vec<u8>| {
        SdpParseError::InvalidAttribute(format!("AES IV must be 16 bytes, got {}", v.len()))
    })?;

    Ok(Some(EncryptionParams {
        wrapped_aes_key,
        aes_iv,
    }))
}
