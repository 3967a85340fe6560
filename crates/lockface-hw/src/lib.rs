//! lockface-hw: Camera access for lockface.
//!
//! Provides V4L2-based grayscale capture and a [`CaptureSession`] that runs
//! the acquisition loop on its own thread and hands the newest frame to
//! whichever controller currently owns the camera.

pub mod camera;
pub mod frame;
pub mod session;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use session::{CaptureConfig, CaptureError, CaptureSession, FrameReceiver};
pub use source::{FrameSource, SourceOpener, V4lOpener};
