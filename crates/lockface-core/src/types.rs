use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Integer pixel rectangle `(x, y, w, h)` clipped to a `width` x `height`
    /// frame, or `None` if nothing of the box lies inside it.
    pub fn clip(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x.floor().max(0.0);
        let y1 = self.y.floor().max(0.0);
        let x2 = (self.x + self.width).ceil().min(width as f32);
        let y2 = (self.y + self.height).ceil().min(height as f32);
        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            return None;
        }
        Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Scale to unit L2 norm. Zero vectors are left untouched.
    pub fn normalized(mut self) -> Self {
        let norm = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            self.values.iter_mut().for_each(|v| *v /= norm);
        }
        self
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance in [0, 2]. Lower = more similar.
    pub fn distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }
}

/// Outcome of identifying one face region.
///
/// `distance` is lower-is-better; `identity` is set only when it fell below
/// the configured threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Identification {
    pub identity: Option<String>,
    pub distance: f32,
}

impl Identification {
    pub fn unknown(distance: f32) -> Self {
        Self { identity: None, distance }
    }
}

/// A recognised identity in a processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub identity: String,
    pub distance: f32,
    pub face: BoundingBox,
}
