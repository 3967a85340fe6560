//! Photo collection contract shared by every storage backend.

use crate::clock::Clock;
use crate::retention::{self, RetentionPolicy, RetentionReport};
use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid user name: {0:?}")]
    InvalidUser(String),
    #[error("photo not found: {0}")]
    PhotoNotFound(String),
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("image codec failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Opaque reference to one stored photo.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhotoHandle {
    pub user: String,
    /// Backend-specific key (the file name for [`crate::FsStore`]).
    pub key: String,
}

impl fmt::Display for PhotoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.key)
    }
}

/// A photo together with its creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoEntry {
    pub handle: PhotoHandle,
    pub created_at: DateTime<Utc>,
}

/// A user's photo collection on durable storage.
///
/// Reads on unknown users return empty results rather than errors.
/// `add` must be visible to an immediately following `list_ordered`.
pub trait PhotoStore: Send + Sync {
    /// Photos of `user`, oldest first. Ties keep insertion order.
    fn list_ordered(&self, user: &str) -> Result<Vec<PhotoEntry>, StoreError>;

    /// Persist `image` as a new photo stamped with the current time and
    /// return the new photo count. Creates the user's namespace if absent.
    fn add(&self, user: &str, image: &GrayImage) -> Result<usize, StoreError>;

    /// Delete one photo. Deleting a photo that is already gone succeeds.
    fn delete(&self, photo: &PhotoHandle) -> Result<(), StoreError>;

    /// Read a stored photo back.
    fn load(&self, photo: &PhotoHandle) -> Result<GrayImage, StoreError>;

    /// Retention parameters applied by [`PhotoStore::add_and_retain`].
    fn policy(&self) -> &RetentionPolicy;

    fn clock(&self) -> &dyn Clock;

    fn count(&self, user: &str) -> Result<usize, StoreError> {
        Ok(self.list_ordered(user)?.len())
    }

    /// `add`, then run a retention pass over the user's collection.
    ///
    /// Only recognition-triggered captures go through here; registration
    /// sessions use plain [`PhotoStore::add`].
    fn add_and_retain(&self, user: &str, image: &GrayImage) -> Result<RetentionReport, StoreError> {
        self.add(user, image)?;
        let now = self.clock().now();
        retention::apply(self, user, self.policy(), now)
    }
}
