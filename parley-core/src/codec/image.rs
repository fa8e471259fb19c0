//! Lossy still-image encoding for camera snapshots.

use ::image::{codecs::jpeg::JpegEncoder, ExtendedColorType, RgbImage};
use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::MediaBlob;
use crate::error::{ParleyError, Result};

pub const JPEG_MIME: &str = "image/jpeg";

/// One camera frame, packed RGB8.
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RgbFrame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(ParleyError::ImageEncode(format!(
                "frame {width}x{height} needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }
}

impl From<RgbImage> for RgbFrame {
    fn from(img: RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            pixels: img.into_raw(),
        }
    }
}

/// Compress a frame to JPEG. `quality` is clamped to 1..=100.
pub fn encode_jpeg(frame: &RgbFrame, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode(
            &frame.pixels,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| ParleyError::ImageEncode(e.to_string()))?;
    Ok(out)
}

/// JPEG-encode a frame and wrap it as an `image/jpeg` blob.
pub fn jpeg_blob(frame: &RgbFrame, quality: u8) -> Result<MediaBlob> {
    let jpeg = encode_jpeg(frame, quality)?;
    Ok(MediaBlob::new(JPEG_MIME, STANDARD.encode(jpeg)))
}
