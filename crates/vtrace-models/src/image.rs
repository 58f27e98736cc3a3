//! Image payloads and validation limits.

use std::sync::Arc;

use crate::error::{ConversionError, ConversionResult};

/// Maximum width or height in pixels.
pub const MAX_IMAGE_DIMENSION: u32 = 8192;

/// Maximum total pixel count (~32 MP, practical engine memory limit).
pub const MAX_IMAGE_PIXELS: u64 = 32_000_000;

/// Bytes per RGBA8 pixel.
const BYTES_PER_PIXEL: usize = 4;

/// An RGBA8 image owned by the caller and treated as read-only.
///
/// Pixel data is shared behind an `Arc` so payloads can be handed to
/// worker threads without copying.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    width: u32,
    height: u32,
    pixels: Arc<Vec<u8>>,
}

impl ImagePayload {
    /// Create a payload, validating dimensions and stride.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> ConversionResult<Self> {
        validate_dimensions(width, height)?;

        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(ConversionError::validation(format!(
                "pixel buffer is {} bytes, expected {} for {}x{} RGBA",
                pixels.len(),
                expected,
                width,
                height
            )));
        }

        Ok(Self {
            width,
            height,
            pixels: Arc::new(pixels),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Total pixel count in megapixels.
    pub fn megapixels(&self) -> f64 {
        (self.width as u64 * self.height as u64) as f64 / 1_000_000.0
    }
}

/// Validate image dimensions against the engine limits.
pub fn validate_dimensions(width: u32, height: u32) -> ConversionResult<()> {
    if width == 0 || height == 0 {
        return Err(ConversionError::validation(format!(
            "invalid image dimensions: {width}x{height}"
        )));
    }

    if width > MAX_IMAGE_DIMENSION || height > MAX_IMAGE_DIMENSION {
        return Err(ConversionError::validation(format!(
            "image dimensions {width}x{height} exceed the {MAX_IMAGE_DIMENSION} px limit"
        )));
    }

    let total = width as u64 * height as u64;
    if total > MAX_IMAGE_PIXELS {
        return Err(ConversionError::validation(format!(
            "image is {total} pixels, exceeds maximum of {MAX_IMAGE_PIXELS}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_image() {
        let payload = ImagePayload::new(2, 2, vec![0u8; 16]).unwrap();
        assert_eq!(payload.width(), 2);
        assert_eq!(payload.pixels().len(), 16);
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert!(ImagePayload::new(0, 10, vec![]).is_err());
    }

    #[test]
    fn rejects_oversized_dimension() {
        assert!(validate_dimensions(MAX_IMAGE_DIMENSION + 1, 10).is_err());
    }

    #[test]
    fn rejects_pixel_count_above_limit() {
        // 8000 x 8000 > 32 MP while both dimensions are in range.
        assert!(validate_dimensions(8000, 8000).is_err());
    }

    #[test]
    fn rejects_wrong_stride() {
        assert!(ImagePayload::new(2, 2, vec![0u8; 15]).is_err());
    }

    #[test]
    fn megapixels_matches_dimensions() {
        let payload = ImagePayload::new(1000, 500, vec![0u8; 2_000_000]).unwrap();
        assert!((payload.megapixels() - 0.5).abs() < f64::EPSILON);
    }
}
