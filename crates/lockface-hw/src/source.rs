//! Frame sources behind the capture session.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;

/// Something that yields frames one at a time. Dropping it releases the device.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Opens a fresh [`FrameSource`]; called on start and on reinitialisation.
pub trait SourceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError>;

    /// Human-readable device name for logs.
    fn describe(&self) -> String;
}

impl FrameSource for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        Camera::read_frame(self)
    }
}

/// Opens a V4L2 device by path.
#[derive(Debug, Clone)]
pub struct V4lOpener {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
}

impl V4lOpener {
    pub fn new(device_path: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            device_path: device_path.into(),
            width,
            height,
        }
    }
}

impl SourceOpener for V4lOpener {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        let camera = Camera::open(&self.device_path, self.width, self.height)?;
        Ok(Box::new(camera))
    }

    fn describe(&self) -> String {
        self.device_path.clone()
    }
}
