//! Camera capture layer: the device abstraction and the frame-buffer pool in front of it.

mod pool;
mod scripted;
mod source;
mod synthetic;

use aperture_types::{config::CameraConfig, status::SensorInfo, ApertureError, Result};
use async_trait::async_trait;
use thiserror::Error;

pub use pool::{PoolError, SlotHandle, SlotPool};
pub use scripted::ScriptedSensor;
pub use source::{FrameLease, FrameSource, SourceStats};
pub use synthetic::SyntheticSensor;

/// A single failed capture as reported by the sensor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct CaptureFault {
    pub reason: String,
}

impl CaptureFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Why `acquire` produced no frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unavailable {
    #[error("camera capture failed: {0}")]
    Fault(String),
    #[error("frame source stopped")]
    Stopped,
}

/// Capture hardware as seen by the frame source.
#[async_trait]
pub trait CaptureDevice: Send + 'static {
    /// Apply the full configuration once, before any capture.
    async fn configure(&mut self, config: &CameraConfig) -> Result<SensorInfo>;

    /// Fill `buffer` with one JPEG frame. The buffer arrives empty.
    async fn capture(&mut self, buffer: &mut Vec<u8>) -> std::result::Result<(), CaptureFault>;
}

/// Generate an error aligned with capture semantics.
pub fn capture_error(message: impl Into<String>) -> ApertureError {
    ApertureError::Capture(message.into())
}
