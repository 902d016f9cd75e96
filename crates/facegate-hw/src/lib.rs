//! facegate-hw — Camera capture for the face pipeline.
//!
//! Provides V4L2-based camera access producing BGR frames, plus the small
//! amount of drawing the live preview needs.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::ConvertError;
