//! Frame type and pixel conversion — YUYV/GREY/Y16 to RGB, dark detection.

use image::RgbImage;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_THRESHOLD: f32 = 0.95;

/// A captured color frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap `image`, classifying it as dark or not.
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&luma(&image), DARK_THRESHOLD);
        Self {
            image,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let y = luma(&self.image);
        if y.is_empty() {
            return 0.0;
        }
        y.iter().map(|&b| b as f32).sum::<f32>() / y.len() as f32
    }
}

/// BT.601 luma of each pixel.
pub fn luma(image: &RgbImage) -> Vec<u8> {
    image
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
        })
        .collect()
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share the
/// chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

/// Expand 8-bit grayscale to RGB.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: gray.len(),
        });
    }
    let rgb = gray[..expected].iter().flat_map(|&g| [g, g, g]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: gray.len(),
    })
}

/// Downscale 16-bit little-endian grayscale to 8-bit.
pub fn y16_to_grey(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    if buf.len() < pixels * 2 {
        return Err(FrameError::InvalidLength {
            expected: pixels * 2,
            actual: buf.len(),
        });
    }
    Ok(buf[..pixels * 2]
        .chunks_exact(2)
        .map(|px| (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8)
        .collect())
}

/// True if more than `threshold_pct` of pixels are near black (< 32).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_gray_pixels() {
        // Neutral chroma: Y=16 is black, Y=235 is white.
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_red_has_red_dominant() {
        // BT.601 studio-swing red: Y=81, U=90, V=240.
        let yuyv = vec![81, 90, 81, 240];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        let [r, g, b] = rgb.get_pixel(0, 0).0;
        assert!(r > 240 && g < 10 && b < 10, "got {r},{g},{b}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_rgb(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_grey_to_rgb() {
        let rgb = grey_to_rgb(&[7, 200], 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [7, 7, 7]);
        assert_eq!(rgb.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn test_y16_to_grey() {
        let buf = [0x00, 0x80, 0xff, 0xff];
        assert_eq!(y16_to_grey(&buf, 2, 1).unwrap(), vec![0x80, 0xff]);
        assert!(y16_to_grey(&buf[..3], 2, 1).is_err());
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&[0u8; 1000], DARK_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&[], DARK_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_borderline() {
        let mut gray = vec![10u8; 960];
        gray.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&gray, DARK_THRESHOLD));

        let mut gray = vec![10u8; 940];
        gray.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&gray, DARK_THRESHOLD));
    }

    #[test]
    fn test_frame_new_classifies() {
        let dark = Frame::new(RgbImage::new(8, 8), 0);
        assert!(dark.is_dark);
        assert_eq!(dark.avg_brightness(), 0.0);

        let lit = Frame::new(RgbImage::from_pixel(8, 8, image::Rgb([120, 130, 140])), 1);
        assert!(!lit.is_dark);
        assert!(lit.avg_brightness() > 100.0);
        assert_eq!((lit.width(), lit.height()), (8, 8));
    }
}
