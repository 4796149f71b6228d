//! Compressed samples for the detection service.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::frame::{Frame, BYTES_PER_PIXEL};

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// A sampled frame encoded as a self-contained JPEG.
#[derive(Clone, Debug)]
pub struct Sample {
    pub camera_id: String,
    pub sequence: u64,
    pub jpeg: Vec<u8>,
}

impl Sample {
    pub fn encode(frame: &Frame, quality: u8) -> Result<Self> {
        Ok(Self {
            camera_id: frame.camera_id().to_string(),
            sequence: frame.sequence(),
            jpeg: encode_jpeg(frame.pixels(), frame.width, frame.height, quality)?,
        })
    }
}

/// Encode packed RGB24 pixels as JPEG.
pub fn encode_jpeg(pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let expected = width as usize * height as usize * BYTES_PER_PIXEL;
    if pixels.len() != expected {
        return Err(anyhow!(
            "RGB frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }
    let mut jpeg = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode(pixels, width, height, ExtendedColorType::Rgb8)
        .context("encode frame as JPEG")?;
    Ok(jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_rgb_as_jpeg() -> Result<()> {
        let pixels = vec![200u8; 16 * 8 * 3];
        let jpeg = encode_jpeg(&pixels, 16, 8, 85)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
        Ok(())
    }

    #[test]
    fn rejects_length_mismatch() {
        assert!(encode_jpeg(&[0u8; 10], 2, 2, 85).is_err());
    }
}
