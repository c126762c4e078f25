use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use aperture_types::{config::CameraConfig, status::SensorInfo, Result};
use async_trait::async_trait;
use tokio::time::{sleep, Duration};
use tracing::info;

use crate::{capture_error, CaptureDevice, CaptureFault};

/// Deterministic sensor for tests and dry runs.
///
/// Produces fake JPEG payloads (SOI, filler, EOI) whose length varies with the
/// capture index, and fails the captures it was told to fail.
pub struct ScriptedSensor {
    base_len: usize,
    interval: Duration,
    fail_on: HashSet<usize>,
    refuse: Option<String>,
    captures: Arc<AtomicUsize>,
    configures: Arc<AtomicUsize>,
}

impl ScriptedSensor {
    pub fn new(base_len: usize) -> Self {
        Self {
            base_len: base_len.max(4),
            interval: Duration::from_millis(1),
            fail_on: HashSet::new(),
            refuse: None,
            captures: Arc::new(AtomicUsize::new(0)),
            configures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the `nth` capture (1-based).
    pub fn fail_on(mut self, nth: usize) -> Self {
        self.fail_on.insert(nth);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn refuse_configuration(mut self, reason: impl Into<String>) -> Self {
        self.refuse = Some(reason.into());
        self
    }

    /// Counter of capture calls, readable after the sensor is moved into a source.
    pub fn capture_calls(&self) -> Arc<AtomicUsize> {
        self.captures.clone()
    }

    pub fn configure_calls(&self) -> Arc<AtomicUsize> {
        self.configures.clone()
    }

    /// Payload length of the `nth` capture.
    pub fn frame_len(&self, nth: usize) -> usize {
        self.base_len + nth % 7
    }
}

#[async_trait]
impl CaptureDevice for ScriptedSensor {
    async fn configure(&mut self, config: &CameraConfig) -> Result<SensorInfo> {
        self.configures.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.refuse {
            return Err(capture_error(format!("camera init failed: {reason}")));
        }
        info!("Scripted sensor configured for {}", config.frame_size);
        Ok(SensorInfo {
            model: "scripted".into(),
            frame_size: config.frame_size,
            jpeg_quality: config.jpeg_quality,
        })
    }

    async fn capture(&mut self, buffer: &mut Vec<u8>) -> std::result::Result<(), CaptureFault> {
        let nth = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.interval.is_zero() {
            sleep(self.interval).await;
        }
        if self.fail_on.contains(&nth) {
            return Err(CaptureFault::new(format!("scripted fault on capture {nth}")));
        }
        let len = self.frame_len(nth);
        buffer.extend_from_slice(&[0xFF, 0xD8]);
        buffer.resize(len - 2, (nth % 251) as u8);
        buffer.extend_from_slice(&[0xFF, 0xD9]);
        Ok(())
    }
}
