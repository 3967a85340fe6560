//! Collaborators shared by the registration and recognition controllers.

use crate::operator::Operator;
use crate::slot::SessionSlot;
use crate::training::TrainingWorker;
use lockface_core::FaceAnalyzer;
use lockface_hw::CaptureSession;
use lockface_store::{PhotoStore, UserRegistry};
use parking_lot::Mutex;
use std::sync::Arc;

/// One analyzer instance, used by whichever controller holds the session slot.
pub type SharedAnalyzer = Arc<Mutex<Box<dyn FaceAnalyzer>>>;

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn PhotoStore>,
    pub registry: Arc<dyn UserRegistry>,
    pub camera: Arc<CaptureSession>,
    pub analyzer: SharedAnalyzer,
    pub training: TrainingWorker,
    pub operator: Arc<dyn Operator>,
    pub slot: Arc<SessionSlot>,
}

/// Stops the camera when dropped, whatever path leaves the capture loop.
pub(crate) struct CameraGuard<'a>(pub &'a CaptureSession);

impl Drop for CameraGuard<'_> {
    fn drop(&mut self) {
        self.0.stop();
    }
}
