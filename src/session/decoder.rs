//! Audio payload decoding to interleaved 16-bit little-endian PCM

use crate::protocol::sdp::{AudioCodec, StreamFormat};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_ALAC, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::formats::Packet;

/// Decode failures; the intake substitutes silence and counts them
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// ALAC decoder could not be constructed
    #[error("cannot create ALAC decoder: {0}")]
    Setup(String),

    /// A payload failed to decode
    #[error("payload decode failed: {0}")]
    BadPayload(String),

    /// A PCM payload had a truncated sample
    #[error("odd PCM payload length {0}")]
    OddLength(usize),
}

/// Stateful decoder for one session's audio stream
pub struct AudioDecoder {
    kind: DecoderKind,
}

enum DecoderKind {
    /// L16 network byte order to LE
    Pcm,
    Alac {
        decoder: Box<dyn Decoder>,
        frames_per_packet: u64,
    },
}

impl AudioDecoder {
    /// Build a decoder for the announced format.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Setup`] when the ALAC decoder rejects the
    /// announced parameters.
    pub fn new(format: &StreamFormat) -> Result<Self, DecodeError> {
        let kind = match format.codec {
            AudioCodec::Pcm => DecoderKind::Pcm,
            AudioCodec::Alac => {
                let alac = format
                    .alac
                    .as_ref()
                    .ok_or_else(|| DecodeError::Setup("missing ALAC parameters".to_string()))?;

                let mut params = CodecParameters::new();
                params
                    .for_codec(CODEC_TYPE_ALAC)
                    .with_sample_rate(alac.sample_rate)
                    .with_extra_data(alac.magic_cookie().into_boxed_slice());

                let decoder = symphonia::default::get_codecs()
                    .make(&params, &DecoderOptions::default())
                    .map_err(|e| DecodeError::Setup(e.to_string()))?;

                DecoderKind::Alac {
                    decoder,
                    frames_per_packet: u64::from(alac.frames_per_packet),
                }
            }
        };
        Ok(Self { kind })
    }

    /// Decode one RTP payload to interleaved i16 LE bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] on malformed payloads; the caller emits
    /// silence of the expected sample count instead.
    pub fn decode(&mut self, payload: &[u8], timestamp: u64) -> Result<Vec<u8>, DecodeError> {
        match &mut self.kind {
            DecoderKind::Pcm => decode_l16(payload),
            DecoderKind::Alac {
                decoder,
                frames_per_packet,
            } => {
                let packet = Packet::new_from_slice(0, timestamp, *frames_per_packet, payload);
                let decoded = decoder
                    .decode(&packet)
                    .map_err(|e| DecodeError::BadPayload(e.to_string()))?;

                let spec = *decoded.spec();
                let mut samples =
                    SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                samples.copy_interleaved_ref(decoded);

                let mut out = Vec::with_capacity(samples.samples().len() * 2);
                for sample in samples.samples() {
                    out.extend_from_slice(&sample.to_le_bytes());
                }
                Ok(out)
            }
        }
    }
}

/// L16 is big-endian on the wire; flip to our little-endian layout
fn decode_l16(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if payload.len() % 2 != 0 {
        return Err(DecodeError::OddLength(payload.len()));
    }
    let mut out = Vec::with_capacity(payload.len());
    for pair in payload.chunks_exact(2) {
        let sample = i16::from_be_bytes([pair[0], pair[1]]);
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Ok(out)
}

impl std::fmt::Debug for AudioDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            DecoderKind::Pcm => "Pcm",
            DecoderKind::Alac { .. } => "Alac",
        };
        f.debug_struct("AudioDecoder").field("kind", &kind).finish()
    }
}
