//! greeter-hw - Hardware abstraction for color camera capture.
//!
//! Opens a V4L2 device by index, negotiates a color pixel format and
//! converts each dequeued buffer into an RGB frame.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraOptions, DeviceInfo, PixelFormat};
pub use frame::Frame;
