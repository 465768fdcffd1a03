//! Frame sampler: keeps the most recent frame from the camera.
//!
//! Driven by its own timer on the scheduler thread, independent of any
//! verification session. Session ticks read the buffered frame.

use greeter_hw::{Camera, CameraError, Frame};
use std::time::Duration;

/// Anything that can be asked for its next frame.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

impl FrameSource for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

/// Camera availability as seen by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    /// Frames are flowing (or about to).
    Streaming,
    /// The device could not be opened or went away; no further capture.
    Unavailable,
}

impl CameraState {
    pub fn as_str(self) -> &'static str {
        match self {
            CameraState::Streaming => "streaming",
            CameraState::Unavailable => "unavailable",
        }
    }
}

pub struct FrameSampler<S> {
    source: Option<S>,
    latest: Option<Frame>,
    consecutive_failures: u32,
    max_age: Option<Duration>,
}

impl<S: FrameSource> FrameSampler<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
            latest: None,
            consecutive_failures: 0,
            max_age: None,
        }
    }

    /// A sampler with no camera; it never produces frames.
    pub fn unavailable() -> Self {
        Self {
            source: None,
            latest: None,
            consecutive_failures: 0,
            max_age: None,
        }
    }

    /// Stop handing out frames older than `limit`, e.g. when the driver
    /// keeps timing out and the buffered image no longer shows the scene.
    pub fn with_max_age(mut self, limit: Option<Duration>) -> Self {
        self.max_age = limit;
        self
    }

    pub fn camera_state(&self) -> CameraState {
        if self.source.is_some() {
            CameraState::Streaming
        } else {
            CameraState::Unavailable
        }
    }

    /// Most recent frame, if the source has produced one, has not failed
    /// since, and the frame is within the age limit.
    pub fn current_frame(&self) -> Option<&Frame> {
        self.latest
            .as_ref()
            .filter(|frame| self.max_age.map_or(true, |limit| frame.age() <= limit))
    }

    /// One capture-timer tick: pull a frame from the source.
    ///
    /// `NoFrameYet` keeps the previous frame. Other transient failures clear
    /// it until capture recovers. `DeviceUnavailable` drops the source for good.
    pub fn capture(&mut self) {
        let Some(source) = self.source.as_mut() else {
            return;
        };

        match source.read_frame() {
            Ok(frame) => {
                if self.consecutive_failures > 0 {
                    tracing::info!(failures = self.consecutive_failures, "frame capture recovered");
                }
                self.consecutive_failures = 0;
                self.latest = Some(frame);
            }
            Err(CameraError::NoFrameYet) => {
                tracing::trace!("no frame ready");
            }
            Err(e) if e.is_transient() => {
                self.consecutive_failures += 1;
                self.latest = None;
                // Log the first failure and then every 100th to avoid flooding.
                if self.consecutive_failures % 100 == 1 {
                    tracing::warn!(error = %e, failures = self.consecutive_failures, "frame capture failed");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "camera lost; verification disabled");
                self.source = None;
                self.latest = None;
            }
        }
    }
}
