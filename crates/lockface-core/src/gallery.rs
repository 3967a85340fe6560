//! Trained face gallery: the model artifact the trainer writes and the
//! analyzer matches against.

use crate::types::{Embedding, Identification};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const GALLERY_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("gallery file is corrupt: {0}")]
    Format(#[from] serde_json::Error),
    #[error("unsupported gallery version {0}")]
    Version(u32),
}

/// One enrolled embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub user: String,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gallery {
    pub version: u32,
    /// Held-out accuracy measured when this gallery was built.
    pub accuracy: f32,
    pub entries: Vec<GalleryEntry>,
}

/// Gallery shared between the trainer (writer) and the analyzer (reader).
pub type SharedGallery = Arc<RwLock<Gallery>>;

impl Default for Gallery {
    fn default() -> Self {
        Self {
            version: GALLERY_FORMAT_VERSION,
            accuracy: 0.0,
            entries: Vec::new(),
        }
    }
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>, accuracy: f32) -> Self {
        Self {
            version: GALLERY_FORMAT_VERSION,
            accuracy,
            entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn shared(self) -> SharedGallery {
        Arc::new(RwLock::new(self))
    }

    /// Nearest enrolled user and its cosine distance.
    ///
    /// Every entry is compared; there is no early exit on a good match.
    pub fn nearest(&self, probe: &Embedding) -> Option<(&str, f32)> {
        let mut best: Option<(&str, f32)> = None;
        for entry in &self.entries {
            let distance = probe.distance(&entry.embedding);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((entry.user.as_str(), distance));
            }
        }
        best
    }

    /// Identify `probe`: a match requires distance strictly below `threshold`.
    pub fn identify(&self, probe: &Embedding, threshold: f32) -> Identification {
        match self.nearest(probe) {
            Some((user, distance)) if distance < threshold => Identification {
                identity: Some(user.to_string()),
                distance,
            },
            Some((_, distance)) => Identification::unknown(distance),
            None => Identification::unknown(f32::INFINITY),
        }
    }

    /// Load from `path`. A missing file yields an empty gallery.
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no gallery yet");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let gallery: Gallery = serde_json::from_slice(&bytes)?;
        if gallery.version != GALLERY_FORMAT_VERSION {
            return Err(GalleryError::Version(gallery.version));
        }
        tracing::info!(path = %path.display(), entries = gallery.entries.len(), "gallery loaded");
        Ok(gallery)
    }

    /// Write to `path` via a sibling temp file and rename, so readers never
    /// observe a partial artifact.
    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
            serde_json::to_writer(&mut file, self)?;
            file.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), entries = self.entries.len(), "gallery saved");
        Ok(())
    }
}
