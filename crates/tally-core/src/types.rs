use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical face sample width in pixels.
pub const SAMPLE_WIDTH: u32 = 50;
/// Canonical face sample height in pixels.
pub const SAMPLE_HEIGHT: u32 = 50;
/// Color channels per sample pixel (RGB).
pub const SAMPLE_CHANNELS: usize = 3;
/// Length of a flattened sample feature vector.
pub const FEATURE_LEN: usize = SAMPLE_WIDTH as usize * SAMPLE_HEIGHT as usize * SAMPLE_CHANNELS;

/// Label a person enrolls under.
pub type Identity = String;

/// Axis-aligned box around a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of raw cascade hits merged into this box.
    pub neighbors: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clip the box to a `width` × `height` frame. Returns `None` if nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(BoundingBox {
            width: w,
            height: h,
            ..*self
        })
    }
}

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("face sample must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A face crop resized to the canonical 50×50 RGB dimensions.
///
/// Pixels are stored row-major, interleaved RGB, which is also the order of
/// the flattened feature vector handed to the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceSample {
    pixels: Vec<u8>,
}

impl FaceSample {
    /// Crop `face` out of `frame` and resize it to the canonical dimensions.
    ///
    /// Returns `None` when the box lies entirely outside the frame.
    pub fn from_crop(frame: &RgbImage, face: &BoundingBox) -> Option<Self> {
        let face = face.clamp_to(frame.width(), frame.height())?;
        let crop = imageops::crop_imm(frame, face.x, face.y, face.width, face.height).to_image();
        // Bilinear, matching the usual resize default for small face patches.
        let resized = imageops::resize(&crop, SAMPLE_WIDTH, SAMPLE_HEIGHT, FilterType::Triangle);
        Some(Self {
            pixels: resized.into_raw(),
        })
    }

    /// Rebuild a sample from stored raw pixels.
    pub fn from_raw(pixels: Vec<u8>) -> Result<Self, SampleError> {
        if pixels.len() != FEATURE_LEN {
            return Err(SampleError::InvalidLength {
                expected: FEATURE_LEN,
                actual: pixels.len(),
            });
        }
        Ok(Self { pixels })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    /// Flattened feature vector of length [`FEATURE_LEN`].
    pub fn features(&self) -> Vec<f32> {
        self.pixels.iter().map(|&p| p as f32).collect()
    }

    /// The sample as an image, e.g. for previews.
    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(SAMPLE_WIDTH, SAMPLE_HEIGHT, self.pixels.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn make_bbox(x: u32, y: u32, w: u32, h: u32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, neighbors: 0 }
    }

    #[test]
    fn test_crop_has_canonical_length() {
        let frame = RgbImage::from_pixel(320, 240, Rgb([10, 20, 30]));
        let sample = FaceSample::from_crop(&frame, &make_bbox(40, 30, 120, 100)).unwrap();
        assert_eq!(sample.as_bytes().len(), FEATURE_LEN);
        assert_eq!(sample.features().len(), FEATURE_LEN);
    }

    #[test]
    fn test_crop_preserves_uniform_color() {
        let frame = RgbImage::from_pixel(100, 100, Rgb([200, 100, 50]));
        let sample = FaceSample::from_crop(&frame, &make_bbox(10, 10, 60, 60)).unwrap();
        for px in sample.as_bytes().chunks(3) {
            assert_eq!(px, &[200, 100, 50]);
        }
    }

    #[test]
    fn test_crop_outside_frame() {
        let frame = RgbImage::new(64, 64);
        assert!(FaceSample::from_crop(&frame, &make_bbox(64, 0, 10, 10)).is_none());
    }

    #[test]
    fn test_crop_partially_outside_is_clamped() {
        let frame = RgbImage::new(64, 64);
        let clamped = make_bbox(50, 50, 40, 40).clamp_to(64, 64).unwrap();
        assert_eq!((clamped.width, clamped.height), (14, 14));
        assert!(FaceSample::from_crop(&frame, &make_bbox(50, 50, 40, 40)).is_some());
    }

    #[test]
    fn test_from_raw_rejects_wrong_length() {
        let err = FaceSample::from_raw(vec![0; 10]).unwrap_err();
        assert!(matches!(err, SampleError::InvalidLength { actual: 10, .. }));
        assert!(FaceSample::from_raw(vec![0; FEATURE_LEN]).is_ok());
    }
}
