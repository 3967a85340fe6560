//! Face crops and frame annotation.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

/// Side length of a stored face photo.
pub const CROP_SIZE: u32 = 128;

const OUTLINE: Luma<u8> = Luma([255]);

/// Cut `face` out of `frame` and scale it to a `CROP_SIZE` square.
///
/// Returns `None` when the box lies entirely outside the frame.
pub fn crop_face(frame: &GrayImage, face: &BoundingBox) -> Option<GrayImage> {
    let (x, y, w, h) = face.clip(frame.width(), frame.height())?;
    let region = imageops::crop_imm(frame, x, y, w, h).to_image();
    Some(imageops::resize(&region, CROP_SIZE, CROP_SIZE, FilterType::Triangle))
}

/// Copy of `frame` with a one-pixel outline around every face.
pub fn annotate(frame: &GrayImage, faces: &[BoundingBox]) -> GrayImage {
    let mut out = frame.clone();
    for face in faces {
        let Some((x, y, w, h)) = face.clip(frame.width(), frame.height()) else {
            continue;
        };
        let (right, bottom) = (x + w - 1, y + h - 1);
        for px in x..=right {
            out.put_pixel(px, y, OUTLINE);
            out.put_pixel(px, bottom, OUTLINE);
        }
        for py in y..=bottom {
            out.put_pixel(x, py, OUTLINE);
            out.put_pixel(right, py, OUTLINE);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_crop_is_fixed_size() {
        let frame = GrayImage::from_pixel(320, 240, Luma([40]));
        let crop = crop_face(&frame, &face(100.0, 60.0, 80.0, 100.0)).unwrap();
        assert_eq!(crop.dimensions(), (CROP_SIZE, CROP_SIZE));
        assert_eq!(crop.get_pixel(64, 64).0[0], 40);
    }

    #[test]
    fn test_crop_clips_partial_faces() {
        let frame = GrayImage::new(320, 240);
        assert!(crop_face(&frame, &face(300.0, 200.0, 80.0, 80.0)).is_some());
        assert!(crop_face(&frame, &face(500.0, 10.0, 40.0, 40.0)).is_none());
    }

    #[test]
    fn test_annotate_draws_outline_only() {
        let frame = GrayImage::new(50, 50);
        let out = annotate(&frame, &[face(10.0, 10.0, 20.0, 20.0)]);
        assert_eq!(out.get_pixel(10, 10).0[0], 255);
        assert_eq!(out.get_pixel(29, 29).0[0], 255);
        assert_eq!(out.get_pixel(20, 20).0[0], 0);
        assert_eq!(frame.get_pixel(10, 10).0[0], 0);
    }
}
