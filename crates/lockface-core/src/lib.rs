//! lockface-core: Face detection, recognition and training.
//!
//! SCRFD finds faces, ArcFace turns 128x128 crops into embeddings, and a
//! JSON gallery of enrolled embeddings answers "who is this" by cosine
//! distance. Inference runs on the CPU through ONNX Runtime.

pub mod analyzer;
pub mod crop;
pub mod detector;
pub mod gallery;
pub mod recognizer;
pub mod trainer;
pub mod types;

use std::path::PathBuf;

pub use analyzer::{frame_image, Analysis, AnalyzerError, FaceAnalyzer, OnnxAnalyzer};
pub use crop::{annotate, crop_face, CROP_SIZE};
pub use gallery::{Gallery, GalleryEntry, GalleryError, SharedGallery};
pub use recognizer::{ArcFaceExtractor, EmbeddingExtractor};
pub use trainer::{GalleryTrainer, TrainError, Trainer};
pub use types::{BoundingBox, Embedding, Identification, Match};

/// Where the ONNX models are looked up when no directory is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/lockface/models")
}
