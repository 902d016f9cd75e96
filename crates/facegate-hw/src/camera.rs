//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, ConvertError};
use facegate_core::{Frame, FrameSource};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Resolution requested from the driver; it may negotiate something else.
const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
/// `/dev/video0` .. `/dev/video4` are probed when no device is configured.
const PROBE_DEVICE_COUNT: usize = 5;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("no usable camera among /dev/video0../dev/video{}", PROBE_DEVICE_COUNT - 1)]
    NoCameraAvailable,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Convert(#[from] ConvertError),
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
    /// Motion JPEG, one JPEG image per buffer.
    Mjpeg,
    /// 8-bit grayscale, replicated into three channels.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
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

        // Ask for YUYV; accept MJPG or GREY if the driver insists.
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
                "unsupported pixel format: {fourcc:?} (need YUYV, MJPG, or GREY)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Open the first of `/dev/video0..4` that works as a capture device.
    pub fn open_first_available() -> Result<Self, CameraError> {
        for i in 0..PROBE_DEVICE_COUNT {
            let path = format!("/dev/video{i}");
            match Self::open(&path) {
                Ok(camera) => return Ok(camera),
                Err(e) => tracing::debug!(device = %path, error = %e, "camera probe failed"),
            }
        }
        Err(CameraError::NoCameraAvailable)
    }

    /// Start a capture stream. Frames come back in capture order.
    pub fn stream(&self) -> Result<FrameStream<'_>, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        Ok(FrameStream {
            camera: self,
            stream,
        })
    }

    /// Convert a raw buffer to BGR based on the negotiated format.
    fn buf_to_bgr(&self, buf: &[u8]) -> Result<Vec<u8>, ConvertError> {
        match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_bgr(buf, self.width, self.height),
            PixelFormat::Mjpeg => frame::mjpeg_to_bgr(buf, self.width, self.height),
            PixelFormat::Grey => frame::grey_to_bgr(buf, self.width, self.height),
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

/// An open capture stream on a [`Camera`].
pub struct FrameStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameStream<'_> {
    /// Dequeue and convert the next frame.
    pub fn capture(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        // MJPEG buffers are only partly filled.
        let used = (meta.bytesused as usize).min(buf.len());
        let payload = if used > 0 { &buf[..used] } else { buf };
        let sequence = meta.sequence;

        let bgr = self.camera.buf_to_bgr(payload)?;
        let frame = Frame::from_bgr(bgr, self.camera.width, self.camera.height)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
        Ok(frame.with_sequence(sequence))
    }

    /// Read and drop `count` frames (exposure settling).
    pub fn discard(&mut self, count: usize) {
        for _ in 0..count {
            if let Err(e) = self.capture() {
                tracing::debug!(error = %e, "warmup frame failed");
            }
        }
    }
}

impl FrameSource for FrameStream<'_> {
    fn next_frame(&mut self) -> Option<Frame> {
        match self.capture() {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!(device = %self.camera.device_path, error = %e, "frame read failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), None);
    }

    #[test]
    fn test_open_missing_device() {
        assert!(matches!(
            Camera::open("/dev/facegate-does-not-exist"),
            Err(CameraError::DeviceNotFound(_))
        ));
    }
}
