//! Builds the gallery artifact from every user's stored photos.

use crate::gallery::{Gallery, GalleryEntry, GalleryError, SharedGallery};
use crate::recognizer::{EmbeddingExtractor, RecognizerError};
use crate::types::Embedding;
use lockface_store::{PhotoStore, StoreError, UserRegistry};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Every Nth photo of a user is held out for evaluation.
const HOLDOUT_EVERY: usize = 5;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no training images found; register a user first")]
    NoTrainingImages,
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
}

/// Rebuilds the recognition model from stored photos.
pub trait Trainer: Send + Sync {
    /// Train and publish a new model; returns held-out accuracy in [0, 1].
    fn train(&self) -> Result<f32, TrainError>;
}

/// Trains a nearest-neighbour [`Gallery`] from ArcFace embeddings.
pub struct GalleryTrainer {
    registry: Arc<dyn UserRegistry>,
    store: Arc<dyn PhotoStore>,
    extractor: Mutex<Box<dyn EmbeddingExtractor>>,
    artifact: PathBuf,
    gallery: SharedGallery,
}

impl GalleryTrainer {
    pub fn new(
        registry: Arc<dyn UserRegistry>,
        store: Arc<dyn PhotoStore>,
        extractor: Box<dyn EmbeddingExtractor>,
        artifact: impl Into<PathBuf>,
        gallery: SharedGallery,
    ) -> Self {
        Self {
            registry,
            store,
            extractor: Mutex::new(extractor),
            artifact: artifact.into(),
            gallery,
        }
    }

    /// Embeddings of `user`'s photos split into (train, held out).
    fn embed_user(&self, user: &str) -> Result<(Vec<Embedding>, Vec<Embedding>), TrainError> {
        let photos = self.store.list_ordered(user)?;
        let mut extractor = self.extractor.lock();
        let mut train = Vec::new();
        let mut holdout = Vec::new();

        for (i, photo) in photos.iter().enumerate() {
            let image = match self.store.load(&photo.handle) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(photo = %photo.handle, error = %e, "skipping unreadable photo");
                    continue;
                }
            };
            let embedding = extractor.embed(&image)?;
            if i % HOLDOUT_EVERY == HOLDOUT_EVERY - 1 {
                holdout.push(embedding);
            } else {
                train.push(embedding);
            }
        }
        Ok((train, holdout))
    }
}

impl Trainer for GalleryTrainer {
    fn train(&self) -> Result<f32, TrainError> {
        let users = self.registry.list()?;
        let mut entries = Vec::new();
        let mut holdout: Vec<(String, Embedding)> = Vec::new();

        for user in &users {
            let (train, held) = self.embed_user(user)?;
            tracing::debug!(user = %user, train = train.len(), holdout = held.len(), "embedded photos");
            entries.extend(train.into_iter().map(|embedding| GalleryEntry {
                user: user.clone(),
                embedding,
            }));
            holdout.extend(held.into_iter().map(|e| (user.clone(), e)));
        }

        if entries.is_empty() {
            tracing::warn!("training aborted: no images");
            return Err(TrainError::NoTrainingImages);
        }

        let mut gallery = Gallery::new(entries, 0.0);
        let correct = holdout
            .iter()
            .filter(|(owner, probe)| gallery.nearest(probe).is_some_and(|(user, _)| user == owner))
            .count();
        gallery.accuracy = if holdout.is_empty() {
            0.0
        } else {
            correct as f32 / holdout.len() as f32
        };

        gallery.save(&self.artifact)?;
        let accuracy = gallery.accuracy;
        let size = gallery.entries.len();
        *self.gallery.write() = gallery;

        tracing::info!(
            users = users.len(),
            entries = size,
            held_out = holdout.len(),
            accuracy,
            path = %self.artifact.display(),
            "training complete"
        );
        Ok(accuracy)
    }
}
