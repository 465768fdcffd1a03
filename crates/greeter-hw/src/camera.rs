//! V4L2 color camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Reference capture resolution.
pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;

const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    /// The device cannot be opened or streamed from at all.
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    /// No frame was ready within the capture timeout.
    #[error("no frame yet")]
    NoFrameYet,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
}

impl CameraError {
    /// Whether the sampler should simply try again on its next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::NoFrameYet | CameraError::CaptureFailed(_))
    }
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
    /// Motion-JPEG, one JPEG image per buffer.
    Mjpeg,
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// Packed 24-bit RGB.
    Rgb24,
    /// Packed 24-bit BGR.
    Bgr24,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            _ => None,
        }
    }
}

/// Options for opening a camera.
#[derive(Debug, Clone)]
pub struct CameraOptions {
    pub width: u32,
    pub height: u32,
    /// How long a capture waits for a buffer before reporting `NoFrameYet`.
    pub timeout: Duration,
}

impl Default for CameraOptions {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            timeout: Duration::from_millis(10),
        }
    }
}

/// An open V4L2 capture device with a running mmap stream.
pub struct Camera {
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// `/dev/videoN` path for a camera index.
    pub fn device_path(index: u32) -> String {
        format!("/dev/video{index}")
    }

    /// Open camera `index` and start streaming at the requested resolution.
    pub fn open(index: u32, options: &CameraOptions) -> Result<Self, CameraError> {
        let device_path = Self::device_path(index);
        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceUnavailable(format!("{device_path} does not exist")));
        }

        let device = Device::with_path(&device_path)
            .map_err(|e| CameraError::DeviceUnavailable(format!("{device_path}: {e}")))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::DeviceUnavailable(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::DeviceUnavailable(format!(
                "{device_path} is not a video capture device"
            )));
        }

        tracing::info!(
            device = %device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        // Ask for MJPG at the target size; accept whatever color format the
        // driver settles on as long as we can convert it.
        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"MJPG");
        fmt.width = options.width;
        fmt.height = options.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need MJPG, YUYV, RGB3 or BGR3)",
                negotiated.fourcc
            ))
        })?;

        if negotiated.width != options.width || negotiated.height != options.height {
            tracing::warn!(
                requested_width = options.width,
                requested_height = options.height,
                width = negotiated.width,
                height = negotiated.height,
                "camera picked a different resolution"
            );
        }
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::DeviceUnavailable(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(options.timeout);

        Ok(Self {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path,
            fourcc: negotiated.fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Dequeue the next frame and convert it to RGB.
    ///
    /// Waits at most the configured timeout; `NoFrameYet` if nothing arrived.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let device_path = &self.device_path;
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| classify_dequeue_error(device_path, e))?;

        // Drivers report the filled size; MJPG buffers are mostly padding.
        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };

        let image = match self.pixel_format {
            PixelFormat::Mjpeg => frame::mjpeg_to_rgb(data),
            PixelFormat::Yuyv => frame::yuyv_to_rgb(data, self.width, self.height),
            PixelFormat::Rgb24 => frame::rgb24_to_rgb(data, self.width, self.height),
            PixelFormat::Bgr24 => frame::bgr24_to_rgb(data, self.width, self.height),
        }
        .map_err(|e| CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format)))?;

        Ok(Frame {
            image,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|index| {
                let path = Self::device_path(index);
                if !Path::new(&path).exists() {
                    return None;
                }
                let dev = Device::with_path(&path).ok()?;
                let caps = dev.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

/// Map a `VIDIOC_DQBUF` failure onto the sampler's error classes.
///
/// An unplugged device fails with ENODEV (sometimes ENXIO or EIO), which std
/// reports as an uncategorized kind, so the raw errno is checked first.
fn classify_dequeue_error(device_path: &str, e: io::Error) -> CameraError {
    if let Some(libc::ENODEV | libc::ENXIO | libc::EIO) = e.raw_os_error() {
        return CameraError::DeviceUnavailable(format!("{device_path}: {e}"));
    }
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => CameraError::NoFrameYet,
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            CameraError::DeviceUnavailable(format!("{device_path}: {e}"))
        }
        _ => CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")),
    }
}
