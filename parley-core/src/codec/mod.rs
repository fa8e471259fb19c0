//! Transport sample format conversion.
//!
//! The live session speaks 16-bit little-endian PCM wrapped in base64 text.
//! Capture windows go out as `audio/pcm;rate=16000`; model speech comes back
//! as `audio/pcm;rate=24000`. Everything here is a pure function.

pub mod image;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes per PCM16 sample.
pub const PCM_SAMPLE_WIDTH: usize = 2;

const PCM_MIME_PREFIX: &str = "audio/pcm";

/// Failure to turn an inbound payload into playable audio.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload length {len} is not a multiple of the {frame_width}-byte frame width")]
    MisalignedLength { len: usize, frame_width: usize },

    #[error("invalid audio format: {0}")]
    InvalidFormat(&'static str),
}

/// A media payload as carried by the session: MIME type plus base64 data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub mime_type: String,
    pub data: String,
}

impl MediaBlob {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Whether this blob carries raw PCM audio.
    pub fn is_pcm_audio(&self) -> bool {
        self.mime_type
            .trim()
            .to_ascii_lowercase()
            .starts_with(PCM_MIME_PREFIX)
    }
}

/// Decoded, playable audio: interleaved f32 frames in [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Average all channels into one.
    pub fn to_mono(&self) -> Vec<f32> {
        let ch = self.channels.max(1) as usize;
        if ch == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    }
}

/// Convert one normalized sample to PCM16, saturating at the int16 range.
#[inline]
fn to_pcm16(sample: f32) -> i16 {
    // `as` maps NaN to 0 and saturates infinities.
    (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode normalized f32 samples as base64 PCM16 little-endian.
pub fn encode_pcm16(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * PCM_SAMPLE_WIDTH);
    for &s in samples {
        bytes.extend_from_slice(&to_pcm16(s).to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Wrap a capture window as an `audio/pcm;rate=N` blob.
pub fn pcm_blob(samples: &[f32], sample_rate: u32) -> MediaBlob {
    MediaBlob::new(pcm_mime(sample_rate), encode_pcm16(samples))
}

pub fn pcm_mime(sample_rate: u32) -> String {
    format!("{PCM_MIME_PREFIX};rate={sample_rate}")
}

/// Extract the `rate=` parameter from a PCM MIME type.
pub fn sample_rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("rate") {
            value.trim().parse().ok().filter(|r: &u32| *r > 0)
        } else {
            None
        }
    })
}

/// Decode a base64 PCM16 payload.
pub fn decode_pcm16(
    payload: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<DecodedAudio, DecodeError> {
    let bytes = STANDARD.decode(payload.trim())?;
    decode_pcm16_bytes(&bytes, sample_rate, channels)
}

/// Decode raw PCM16 little-endian bytes.
///
/// # Errors
/// `DecodeError::MisalignedLength` when the length is not a whole number of
/// frames, `DecodeError::InvalidFormat` for a zero rate or channel count.
pub fn decode_pcm16_bytes(
    bytes: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<DecodedAudio, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::InvalidFormat("zero channels"));
    }
    if sample_rate == 0 {
        return Err(DecodeError::InvalidFormat("zero sample rate"));
    }
    let frame_width = PCM_SAMPLE_WIDTH * channels as usize;
    if bytes.len() % frame_width != 0 {
        return Err(DecodeError::MisalignedLength {
            len: bytes.len(),
            frame_width,
        });
    }

    let samples = bytes
        .chunks_exact(PCM_SAMPLE_WIDTH)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(DecodedAudio {
        samples,
        channels,
        sample_rate,
    })
}
