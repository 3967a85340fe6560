//! ArcFace embedding extraction via ONNX Runtime.
//!
//! Works on the stored 128x128 grayscale face crops, resized to the 112x112
//! ArcFace input. Crops are not landmark-aligned.

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a face crop to an embedding.
pub trait EmbeddingExtractor: Send {
    fn embed(&mut self, face: &GrayImage) -> Result<Embedding, RecognizerError>;
}

/// ArcFace (w600k_r50) extractor.
pub struct ArcFaceExtractor {
    session: Session,
}

impl ArcFaceExtractor {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    fn preprocess(face: &GrayImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let input = if face.dimensions() == (size, size) {
            face.clone()
        } else {
            imageops::resize(face, size, size, FilterType::Triangle)
        };

        let n = size as usize;
        Array4::from_shape_fn((1, 3, n, n), |(_, _, y, x)| {
            (input.get_pixel(x as u32, y as u32).0[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD
        })
    }
}

impl EmbeddingExtractor for ArcFaceExtractor {
    fn embed(&mut self, face: &GrayImage) -> Result<Embedding, RecognizerError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(RecognizerError::InferenceFailed("empty face crop".into()));
        }
        let input = Self::preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;
        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(raw.to_vec()).normalized())
    }
}
