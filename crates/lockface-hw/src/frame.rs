//! Grayscale frame type and YUYV conversion.

use std::time::Instant;

/// A captured grayscale camera frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
            sequence,
        }
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// True if more than `threshold_pct` of pixels sit in the darkest bucket (0–31).
    pub fn is_dark(&self, threshold_pct: f32) -> bool {
        if self.data.is_empty() {
            return true;
        }
        let dark = self.data.iter().filter(|&&p| p < 32).count();
        (dark as f32 / self.data.len() as f32) > threshold_pct
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        let gray = yuyv_to_grayscale(&yuyv, 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_ignores_trailing_bytes() {
        let yuyv = vec![10, 0, 20, 0, 99, 99];
        assert_eq!(yuyv_to_grayscale(&yuyv, 2, 1).unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_grayscale(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_frame_brightness_and_darkness() {
        let bright = Frame::new(vec![200u8; 100], 10, 10, 0);
        assert!((bright.avg_brightness() - 200.0).abs() < 1e-3);
        assert!(!bright.is_dark(0.95));

        let mut data = vec![5u8; 97];
        data.extend([255u8; 3]);
        let dark = Frame::new(data, 10, 10, 1);
        assert!(dark.is_dark(0.95));

        assert!(Frame::new(Vec::new(), 0, 0, 2).is_dark(0.95));
    }
}
