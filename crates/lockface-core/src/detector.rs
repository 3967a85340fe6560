//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the grayscale frame into the 640x640 model input, decodes the
//! anchor-free score/bbox heads at strides 8, 16 and 32, then suppresses
//! overlapping boxes. Landmark heads are ignored: faces are cropped by box.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Where the frame landed inside the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, input: u32) -> (Self, u32, u32) {
        let scale = (input as f32 / width as f32).min(input as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, input);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, input);
        let letterbox = Self {
            scale,
            pad_x: ((input - new_w) / 2) as f32,
            pad_y: ((input - new_h) / 2) as f32,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point from model-input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices `(score, bbox)` for one stride.
type StrideOutputs = (usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs score and bbox outputs for 3 strides, model has {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_outputs(&output_names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            mapping = ?stride_outputs,
            "loaded SCRFD model"
        );

        Ok(Self { session, stride_outputs })
    }

    /// Detect faces, returning boxes sorted by descending confidence.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(scores, boxes, stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::trace!(faces = faces.len(), "detection complete");
        Ok(faces)
    }
}

/// Letterbox `frame` into a normalised NCHW tensor (gray replicated to 3 channels).
fn preprocess(frame: &GrayImage) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(frame.width(), frame.height(), SCRFD_INPUT_SIZE);
    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);
    let (pad_x, pad_y) = (letterbox.pad_x as u32, letterbox.pad_y as u32);

    let size = SCRFD_INPUT_SIZE as usize;
    let tensor = Array4::from_shape_fn((1, 3, size, size), |(_, _, y, x)| {
        let (x, y) = (x as u32, y as u32);
        let inside = x >= pad_x && x < pad_x + new_w && y >= pad_y && y < pad_y + new_h;
        let pixel = if inside {
            resized.get_pixel(x - pad_x, y - pad_y).0[0] as f32
        } else {
            SCRFD_MEAN
        };
        (pixel - SCRFD_MEAN) / SCRFD_STD
    });

    (tensor, letterbox)
}

/// Find `score_<stride>` / `bbox_<stride>` outputs by name, falling back to
/// the conventional export order: scores 0-2, boxes 3-5.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

/// Decode the anchors of one stride whose score clears `threshold`.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= threshold {
                return None;
            }
            let offsets = boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let (x1, y1) = letterbox.unmap(cx - offsets[0] * step, cy - offsets[1] * step);
            let (x2, y2) = letterbox.unmap(cx + offsets[2] * step, cy + offsets[3] * step);
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if keep.iter().all(|kept| kept.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}
