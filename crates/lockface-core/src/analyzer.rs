//! The recognizer contract used by both controllers.

use crate::crop;
use crate::detector::{DetectorError, FaceDetector};
use crate::gallery::SharedGallery;
use crate::recognizer::{ArcFaceExtractor, EmbeddingExtractor, RecognizerError};
use crate::types::{BoundingBox, Identification, Match};
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
}

/// Result of running the full pipeline over one frame.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// The frame with detected faces outlined.
    pub annotated: GrayImage,
    pub faces: Vec<BoundingBox>,
    /// Faces whose identity passed the threshold.
    pub matches: Vec<Match>,
}

/// Detection plus identification over grayscale frames.
pub trait FaceAnalyzer: Send {
    /// Face regions in `frame`, most confident first.
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<BoundingBox>, AnalyzerError>;

    /// Identify one cropped face. Lower distance is better.
    fn identify(&mut self, face: &GrayImage) -> Result<Identification, AnalyzerError>;

    fn process(&mut self, frame: &GrayImage) -> Result<Analysis, AnalyzerError> {
        let faces = self.detect(frame)?;
        let mut matches = Vec::new();
        for face in &faces {
            let Some(crop) = crop::crop_face(frame, face) else {
                continue;
            };
            let id = self.identify(&crop)?;
            if let Some(identity) = id.identity {
                matches.push(Match {
                    identity,
                    distance: id.distance,
                    face: face.clone(),
                });
            }
        }
        Ok(Analysis {
            annotated: crop::annotate(frame, &faces),
            faces,
            matches,
        })
    }
}

/// Wrap a raw grayscale buffer without copying.
pub fn frame_image(data: Vec<u8>, width: u32, height: u32) -> Result<GrayImage, AnalyzerError> {
    GrayImage::from_raw(width, height, data).ok_or(AnalyzerError::InvalidFrame { width, height })
}

/// SCRFD + ArcFace against a shared gallery.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    extractor: Box<dyn EmbeddingExtractor>,
    gallery: SharedGallery,
    threshold: f32,
}

impl OnnxAnalyzer {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path, gallery: SharedGallery, threshold: f32) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL))?;
        let extractor = ArcFaceExtractor::load(&model_dir.join(RECOGNIZER_MODEL))?;
        Ok(Self {
            detector,
            extractor: Box::new(extractor),
            gallery,
            threshold,
        })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
        Ok(self.detector.detect(frame)?)
    }

    fn identify(&mut self, face: &GrayImage) -> Result<Identification, AnalyzerError> {
        let embedding = self.extractor.embed(face)?;
        let id = self.gallery.read().identify(&embedding, self.threshold);
        tracing::trace!(identity = ?id.identity, distance = id.distance, "face identified");
        Ok(id)
    }
}
