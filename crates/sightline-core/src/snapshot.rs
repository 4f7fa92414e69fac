//! Face snapshot cropping and JPEG encoding.

use crate::collaborator::SnapshotEncoder;
use crate::source::Frame;
use crate::types::BoundingBox;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use thiserror::Error;

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot region is empty or outside the frame")]
    EmptyCrop,
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Copy the `bbox` region out of `frame`, clamped to the frame bounds.
pub fn crop_face(frame: &Frame, bbox: &BoundingBox) -> Result<RgbImage, SnapshotError> {
    let (x, y, w, h) = bbox
        .clamp_to(frame.width(), frame.height())
        .ok_or(SnapshotError::EmptyCrop)?;
    Ok(image::imageops::crop_imm(&frame.image, x, y, w, h).to_image())
}

/// Baseline JPEG encoder for visit snapshots.
pub struct JpegSnapshotEncoder {
    quality: u8,
}

impl JpegSnapshotEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn try_encode(&self, crop: &RgbImage) -> Result<Vec<u8>, SnapshotError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(SnapshotError::EmptyCrop);
        }
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, self.quality).write_image(
            crop.as_raw(),
            crop.width(),
            crop.height(),
            ExtendedColorType::Rgb8,
        )?;
        Ok(buf)
    }
}

impl Default for JpegSnapshotEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl SnapshotEncoder for JpegSnapshotEncoder {
    fn encode(&self, crop: &RgbImage) -> Option<Vec<u8>> {
        match self.try_encode(crop) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(error = %e, "snapshot not encoded");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::Rgb;

    fn frame(w: u32, h: u32) -> Frame {
        let image = RgbImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, 7]));
        Frame::new(image, 1, Utc::now())
    }

    #[test]
    fn test_crop_inside_frame() {
        let f = frame(64, 48);
        let crop = crop_face(&f, &BoundingBox::new(10, 5, 30, 25)).unwrap();
        assert_eq!(crop.dimensions(), (20, 20));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([10, 5, 7]));
    }

    #[test]
    fn test_crop_clamped_to_frame() {
        let f = frame(64, 48);
        let crop = crop_face(&f, &BoundingBox::new(-5, 40, 10, 100)).unwrap();
        assert_eq!(crop.dimensions(), (10, 8));
    }

    #[test]
    fn test_crop_degenerate_is_empty() {
        let f = frame(64, 48);
        assert!(matches!(
            crop_face(&f, &BoundingBox::new(10, 10, 10, 30)),
            Err(SnapshotError::EmptyCrop)
        ));
        assert!(matches!(
            crop_face(&f, &BoundingBox::new(100, 100, 120, 120)),
            Err(SnapshotError::EmptyCrop)
        ));
    }

    #[test]
    fn test_jpeg_encode_produces_jpeg() {
        let crop = frame(16, 16).image;
        let bytes = JpegSnapshotEncoder::default().encode(&crop).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "missing JPEG SOI marker");
    }

    #[test]
    fn test_jpeg_encode_empty_is_none() {
        assert!(JpegSnapshotEncoder::new(90).encode(&RgbImage::new(0, 0)).is_none());
    }
}
