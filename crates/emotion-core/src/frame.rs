//! Grayscale frame type and decoding of uploaded image bytes.

use image::{GrayImage, ImageBuffer, Luma};
use thiserror::Error;

/// Upper bound on either side of a decoded image.
const MAX_DIMENSION: u32 = 8192;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image is empty ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("image too large: {width}x{height} exceeds {max} px", max = MAX_DIMENSION)]
    TooLarge { width: u32, height: u32 },
}

/// A decoded grayscale image, the input the detector and classifier share.
#[derive(Clone, Debug)]
pub struct GrayFrame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl GrayFrame {
    /// Decode an encoded image (JPEG, PNG, ...) and convert it to luma.
    ///
    /// The container format is guessed from the bytes, never from the
    /// client-declared content type.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let decoded = image::load_from_memory(bytes)?;
        let (width, height) = (decoded.width(), decoded.height());
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(FrameError::TooLarge { width, height });
        }

        let luma = decoded.to_luma8();
        tracing::debug!(width, height, "decoded upload to grayscale");
        Ok(Self::from(luma))
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Borrow the frame as an `image` buffer for resampling.
    ///
    /// `None` when the pixel buffer is shorter than `width * height`.
    pub fn view(&self) -> Option<ImageBuffer<Luma<u8>, &[u8]>> {
        ImageBuffer::from_raw(self.width, self.height, self.data.as_slice())
    }
}

impl From<GrayImage> for GrayFrame {
    fn from(img: GrayImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            data: img.into_raw(),
            width,
            height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn encode_png(img: &RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_png_to_gray() {
        let img = RgbImage::from_pixel(12, 8, image::Rgb([200, 200, 200]));
        let frame = GrayFrame::decode(&encode_png(&img)).unwrap();
        assert_eq!((frame.width, frame.height), (12, 8));
        assert_eq!(frame.data.len(), 12 * 8);
        assert!((frame.avg_brightness() - 200.0).abs() < 2.0);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = GrayFrame::decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
    }

    #[test]
    fn test_decode_empty_bytes_fails() {
        assert!(GrayFrame::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_truncated_png_fails() {
        let img = RgbImage::from_pixel(32, 32, image::Rgb([10, 20, 30]));
        let bytes = encode_png(&img);
        assert!(GrayFrame::decode(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_from_gray_image() {
        let img = GrayImage::from_pixel(4, 3, Luma([7]));
        let frame = GrayFrame::from(img);
        assert_eq!(frame.data, vec![7u8; 12]);
        assert!(frame.view().is_some());

        let short = GrayFrame { data: vec![0; 5], width: 4, height: 3 };
        assert!(short.view().is_none());
    }

    #[test]
    fn test_avg_brightness_empty() {
        let frame = GrayFrame { data: vec![], width: 0, height: 0 };
        assert_eq!(frame.avg_brightness(), 0.0);
    }
}
