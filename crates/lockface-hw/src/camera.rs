//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Kernel-side buffers kept queued while streaming.
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else {
            None
        }
    }
}

/// An open, streaming V4L2 camera.
///
/// Dropping the camera stops the stream and closes the device.
pub struct Camera {
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 device and start streaming at (roughly) the requested size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, GREY, or Y16)",
                negotiated.fourcc
            ))
        })?;

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "camera streaming"
        );

        Ok(Self {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            pixel_format,
        })
    }

    /// Dequeue the next frame as grayscale.
    pub fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;
        let data = to_grayscale(self.pixel_format, buf, self.width, self.height)?;
        Ok(Frame::new(data, self.width, self.height, sequence))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|i| {
                let path = format!("/dev/video{i}");
                if !Path::new(&path).exists() {
                    return None;
                }
                let dev = Device::with_path(&path).ok()?;
                let caps = dev.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

/// Convert a raw buffer in `format` to 8-bit grayscale.
fn to_grayscale(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
    let pixels = (width * height) as usize;
    match format {
        PixelFormat::Grey => buf
            .get(..pixels)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| short_buffer("GREY", pixels, buf.len())),
        PixelFormat::Y16 => {
            let bytes = buf
                .get(..pixels * 2)
                .ok_or_else(|| short_buffer("Y16", pixels * 2, buf.len()))?;
            // Keep the high byte of each little-endian sample.
            Ok(bytes.chunks_exact(2).map(|px| px[1]).collect())
        }
        PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
    }
}

fn short_buffer(kind: &str, expected: usize, actual: usize) -> CameraError {
    CameraError::CaptureFailed(format!("{kind} buffer too short: expected {expected}, got {actual}"))
}
