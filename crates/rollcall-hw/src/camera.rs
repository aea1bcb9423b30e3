//! V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, Frame};
use image::{ImageFormat, RgbImage};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// A dequeue that takes longer than this is reported as a capture failure.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

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
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Packed 24-bit RGB.
    Rgb3,
    /// Motion-JPEG, one JPEG image per buffer.
    Mjpg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"RGB3") {
            Some(Self::Rgb3)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(Self::Mjpg)
        } else {
            None
        }
    }
}

/// V4L2 camera device handle.
///
/// The mmap stream is started by the first capture and kept running across
/// captures until [`Camera::stop_stream`], so warmup frames and the capture
/// loop share one stream.
pub struct Camera {
    stream: Option<MmapStream<'static>>,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
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

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; webcams that only stream MJPG or RGB3 are accepted too.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, RGB3, or MJPG)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            stream: None,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Capture the next frame from the stream, converted to RGB.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            self.stream = Some(self.start_stream()?);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::CaptureFailed("stream not running".into()))?;

        let dequeued = stream.next().map(|(buf, meta)| {
            (
                buf_to_rgb(self.pixel_format, buf, self.width, self.height),
                meta.sequence,
            )
        });
        let (image, sequence) = match dequeued {
            Ok((image, sequence)) => (image?, sequence),
            Err(e) => {
                // Restart the stream on the next capture.
                self.stream = None;
                return Err(CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")));
            }
        };

        let is_dark = frame::is_dark_frame(&image, 0.95);
        if is_dark {
            tracing::debug!(seq = sequence, "dark frame");
        }

        Ok(Frame {
            image,
            sequence,
            is_dark,
        })
    }

    fn start_stream(&self) -> Result<MmapStream<'static>, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?;
        stream.set_timeout(DEQUEUE_TIMEOUT);
        tracing::debug!(device = %self.device_path, "stream started");
        Ok(stream)
    }

    /// Stop streaming and release the mmap buffers. The next capture starts
    /// a fresh stream.
    pub fn stop_stream(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(device = %self.device_path, "stream stopped");
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Capture and drop `count` frames so auto-exposure can settle.
    pub fn discard_frames(&mut self, count: usize) {
        for _ in 0..count {
            if let Err(e) = self.capture_frame() {
                tracing::debug!(error = %e, "warmup frame failed");
            }
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// Convert a raw buffer to RGB based on the negotiated format.
fn buf_to_rgb(
    format: PixelFormat,
    buf: &[u8],
    width: u32,
    height: u32,
) -> Result<RgbImage, CameraError> {
    match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        PixelFormat::Rgb3 => {
            let expected = (width * height * 3) as usize;
            if buf.len() < expected {
                return Err(CameraError::CaptureFailed(format!(
                    "RGB3 buffer too short: expected {expected}, got {}",
                    buf.len()
                )));
            }
            RgbImage::from_raw(width, height, buf[..expected].to_vec())
                .ok_or_else(|| CameraError::CaptureFailed("RGB3 buffer size mismatch".into()))
        }
        PixelFormat::Mjpg => image::load_from_memory_with_format(buf, ImageFormat::Jpeg)
            .map(|img| img.to_rgb8())
            .map_err(|e| CameraError::CaptureFailed(format!("MJPG decode failed: {e}"))),
    }
}
