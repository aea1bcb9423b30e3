//! rollcall-hw: Webcam capture for the attendance camera loop.
//!
//! Provides V4L2-based capture producing RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
