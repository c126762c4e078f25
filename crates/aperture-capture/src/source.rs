//! The frame source: a slot pool fed by a background capture driver.

use std::{
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use aperture_types::{
    config::{CameraConfig, GrabPolicy},
    frame::Frame,
    status::{PoolOccupancy, SensorInfo},
    Result,
};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    pool::{SlotHandle, SlotPool},
    CaptureDevice, CaptureFault, Unavailable,
};

struct PoolInner {
    slots: SlotPool,
    /// Fault that struck while a consumer was waiting and not yet handed out.
    fault: Option<CaptureFault>,
    /// Consumers parked in `acquire`.
    waiting: usize,
    stopped: bool,
    captured: u64,
    faults: u64,
    released: u64,
    rejected_releases: u64,
}

struct Shared {
    inner: Mutex<PoolInner>,
    frame_ready: Notify,
    slot_freed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // Every transition completes under the lock, so a poisoned guard still holds a valid pool.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_in(&self, handle: SlotHandle, buffer: Vec<u8>) {
        {
            let mut inner = self.lock();
            match inner.slots.check_in(handle, buffer) {
                Ok(()) => inner.released += 1,
                Err(err) => {
                    inner.rejected_releases += 1;
                    error!("Rejected frame release: {err}");
                }
            }
        }
        self.slot_freed.notify_waiters();
    }

    fn stop_waiting(&self) {
        let mut inner = self.lock();
        inner.waiting = inner.waiting.saturating_sub(1);
        if inner.waiting == 0 {
            if let Some(fault) = inner.fault.take() {
                debug!("Discarding capture fault with no consumer left to receive it: {fault}");
            }
        }
    }

    fn stop(&self) {
        self.lock().stopped = true;
        self.frame_ready.notify_waiters();
        self.slot_freed.notify_waiters();
    }
}

/// Exclusive hold on one captured frame.
///
/// Dropping the lease returns its slot to the pool, so every exit path of a
/// consumer releases exactly once.
pub struct FrameLease {
    frame: Option<Frame>,
    handle: SlotHandle,
    shared: Arc<Shared>,
}

/// Counts a consumer as waiting for the next capture until dropped.
struct WaitingConsumer<'a> {
    shared: &'a Shared,
}

impl Drop for WaitingConsumer<'_> {
    fn drop(&mut self) {
        self.shared.stop_waiting();
    }
}

impl FrameLease {
    pub fn slot(&self) -> usize {
        self.handle.index()
    }
}

impl Deref for FrameLease {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        self.frame
            .as_ref()
            .expect("frame is present until the lease is dropped")
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            trace!(sequence = frame.sequence(), "releasing frame");
            self.shared.check_in(self.handle, frame.into_buffer());
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub occupancy: PoolOccupancy,
    pub captured: u64,
    pub faults: u64,
    pub dropped: u64,
    pub released: u64,
    pub rejected_releases: u64,
}

/// Bounded pool of frame buffers kept full by a capture driver task.
pub struct FrameSource {
    shared: Arc<Shared>,
    policy: GrabPolicy,
    sensor: SensorInfo,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl FrameSource {
    /// Validate the configuration, bring the device up, and start capturing.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        mut device: Box<dyn CaptureDevice>,
        config: &CameraConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let sensor = device.configure(config).await?;
        info!(
            "Camera initialized: frame size: {}, quality: {}, buffers: {}, policy: {}",
            sensor.frame_size, sensor.jpeg_quality, config.buffer_count, config.grab_policy
        );

        let (width, height) = config.frame_size.dimensions();
        let buffer_hint = (width as usize * height as usize) / 8;
        let shared = Arc::new(Shared {
            inner: Mutex::new(PoolInner {
                slots: SlotPool::new(config.buffer_count, config.grab_policy, buffer_hint),
                fault: None,
                waiting: 0,
                stopped: false,
                captured: 0,
                faults: 0,
                released: 0,
                rejected_releases: 0,
            }),
            frame_ready: Notify::new(),
            slot_freed: Notify::new(),
        });

        let cancel = cancel.child_token();
        let driver = tokio::spawn(capture_driver(device, shared.clone(), cancel.clone()));

        Ok(Self {
            shared,
            policy: config.grab_policy,
            sensor,
            cancel,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Wait for a captured frame, or report why none is coming.
    ///
    /// Frames already captured are handed out without waiting. A capture
    /// fault is only reported to a call that was waiting when it happened,
    /// and only once; faults nobody waited for are logged and dropped. The
    /// driver keeps capturing either way, so a later call may succeed.
    pub async fn acquire(&self) -> std::result::Result<FrameLease, Unavailable> {
        let mut waiting: Option<WaitingConsumer<'_>> = None;
        loop {
            let ready = self.shared.frame_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut inner = self.shared.lock();
                if waiting.is_some() {
                    if let Some(fault) = inner.fault.take() {
                        return Err(Unavailable::Fault(fault.reason));
                    }
                }
                let recycled_before = inner.slots.dropped();
                if let Some((handle, frame)) = inner.slots.check_out() {
                    let recycled = inner.slots.dropped() > recycled_before;
                    drop(inner);
                    if recycled {
                        self.shared.slot_freed.notify_waiters();
                    }
                    return Ok(FrameLease {
                        frame: Some(frame),
                        handle,
                        shared: self.shared.clone(),
                    });
                }
                if inner.stopped {
                    return Err(Unavailable::Stopped);
                }
                if waiting.is_none() {
                    inner.waiting += 1;
                    waiting = Some(WaitingConsumer {
                        shared: &self.shared,
                    });
                }
            }

            ready.await;
        }
    }

    /// Give a frame back. Equivalent to dropping the lease.
    pub fn release(&self, lease: FrameLease) {
        if !Arc::ptr_eq(&lease.shared, &self.shared) {
            warn!("Releasing a frame that belongs to another source");
        }
        drop(lease);
    }

    pub fn policy(&self) -> GrabPolicy {
        self.policy
    }

    pub fn sensor(&self) -> &SensorInfo {
        &self.sensor
    }

    pub fn stats(&self) -> SourceStats {
        let inner = self.shared.lock();
        SourceStats {
            occupancy: inner.slots.occupancy(),
            captured: inner.captured,
            faults: inner.faults,
            dropped: inner.slots.dropped(),
            released: inner.released,
            rejected_releases: inner.rejected_releases,
        }
    }

    /// Stop the driver and fail any pending or future `acquire`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.shared.stop();
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            if let Err(err) = driver.await {
                warn!("Capture driver ended abnormally: {err}");
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.shared.stop();
    }
}

async fn capture_driver(
    mut device: Box<dyn CaptureDevice>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    debug!("Capture driver started");
    loop {
        let claimed = tokio::select! {
            _ = cancel.cancelled() => None,
            claimed = claim_slot(&shared) => claimed,
        };
        let Some((handle, mut buffer)) = claimed else {
            break;
        };

        buffer.clear();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = device.capture(&mut buffer) => outcome,
        };

        {
            let mut inner = shared.lock();
            let published = match outcome {
                Ok(()) => match inner.slots.complete_fill(handle, buffer) {
                    Ok(sequence) => {
                        inner.captured += 1;
                        trace!(sequence, "frame captured");
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
                Err(fault) => {
                    warn!("Camera capture failed: {fault}");
                    inner.faults += 1;
                    if inner.waiting > 0 {
                        inner.fault = Some(fault);
                    }
                    inner.slots.abort_fill(handle, buffer)
                }
            };
            if let Err(err) = published {
                error!("Capture driver lost track of slot {}: {err}", handle.index());
            }
        }
        shared.frame_ready.notify_waiters();
        tokio::task::yield_now().await;
    }
    shared.stop();
    debug!("Capture driver stopped");
}

/// Wait until the pool has a slot to fill.
async fn claim_slot(shared: &Shared) -> Option<(SlotHandle, Vec<u8>)> {
    loop {
        let freed = shared.slot_freed.notified();
        tokio::pin!(freed);
        freed.as_mut().enable();

        {
            let mut inner = shared.lock();
            if inner.stopped {
                return None;
            }
            if let Some(claimed) = inner.slots.begin_fill() {
                return Some(claimed);
            }
        }

        freed.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptedSensor;
    use aperture_types::ApertureError;
    use std::time::Duration;
    use tokio::time::timeout;

    fn camera(buffers: usize, policy: GrabPolicy) -> CameraConfig {
        CameraConfig {
            buffer_count: buffers,
            grab_policy: policy,
            ..CameraConfig::default()
        }
    }

    async fn source(sensor: ScriptedSensor, buffers: usize, policy: GrabPolicy) -> FrameSource {
        FrameSource::start(Box::new(sensor), &camera(buffers, policy), CancellationToken::new())
            .await
            .expect("start source")
    }

    #[tokio::test]
    async fn sequential_acquires_are_contiguous_when_empty() {
        let source = source(ScriptedSensor::new(64), 1, GrabPolicy::WhenEmpty).await;
        for expected in 1..=5 {
            let lease = source.acquire().await.expect("frame");
            assert_eq!(lease.sequence(), expected);
            assert!(lease.len() >= 64);
            source.release(lease);
        }
        let stats = source.stats();
        assert_eq!(stats.released, 5);
        assert_eq!(stats.dropped, 0);
        source.shutdown().await;
    }

    #[tokio::test]
    async fn outstanding_frames_never_exceed_pool() {
        let source = source(ScriptedSensor::new(16), 2, GrabPolicy::WhenEmpty).await;
        let first = source.acquire().await.unwrap();
        let second = source.acquire().await.unwrap();
        assert_eq!(source.stats().occupancy.checked_out, 2);

        let third = timeout(Duration::from_millis(50), source.acquire()).await;
        assert!(third.is_err(), "third acquire must block while both slots are out");

        drop(first);
        let third = timeout(Duration::from_secs(1), source.acquire())
            .await
            .expect("slot freed")
            .expect("frame");
        assert!(third.sequence() > second.sequence());
        source.shutdown().await;
    }

    #[tokio::test]
    async fn fault_is_reported_once_then_capture_resumes() {
        let source = source(ScriptedSensor::new(16).fail_on(2), 1, GrabPolicy::WhenEmpty).await;
        let first = source.acquire().await.unwrap();
        assert_eq!(first.sequence(), 1);
        drop(first);

        assert!(matches!(source.acquire().await, Err(Unavailable::Fault(_))));
        let next = source.acquire().await.expect("capture resumes after fault");
        assert_eq!(next.sequence(), 2);
        source.shutdown().await;
    }

    #[tokio::test]
    async fn fault_before_any_consumer_is_not_reported_later() {
        let sensor = ScriptedSensor::new(16).fail_on(1);
        let calls = sensor.capture_calls();
        let source = source(sensor, 1, GrabPolicy::WhenEmpty).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(calls.load(std::sync::atomic::Ordering::SeqCst) >= 2, "driver kept capturing");

        let lease = timeout(Duration::from_secs(1), source.acquire())
            .await
            .expect("acquire finished")
            .expect("no stale fault");
        assert_eq!(lease.sequence(), 1);
        drop(lease);

        let stats = source.stats();
        assert_eq!(stats.faults, 1);
        assert_eq!(stats.occupancy.checked_out, 0);
        source.shutdown().await;
    }

    #[tokio::test]
    async fn latest_policy_skips_stale_frames() {
        let source = source(ScriptedSensor::new(16), 3, GrabPolicy::Latest).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first = source.acquire().await.unwrap();
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = source.acquire().await.unwrap();
        assert!(second.sequence() > 1);
        assert!(source.stats().dropped > 0);
        source.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_wakes_pending_acquire() {
        let source = Arc::new(
            source(
                ScriptedSensor::new(16).with_interval(Duration::from_secs(60)),
                1,
                GrabPolicy::WhenEmpty,
            )
            .await,
        );
        let waiter = {
            let source = source.clone();
            tokio::spawn(async move { source.acquire().await.map(|lease| lease.sequence()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.shutdown().await;
        let outcome = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("join");
        assert_eq!(outcome, Err(Unavailable::Stopped));
    }

    #[tokio::test]
    async fn invalid_configuration_never_reaches_device() {
        let sensor = ScriptedSensor::new(16);
        let configured = sensor.configure_calls();
        let config = CameraConfig {
            buffer_count: 0,
            ..CameraConfig::default()
        };
        let result = FrameSource::start(Box::new(sensor), &config, CancellationToken::new()).await;
        assert!(matches!(result, Err(ApertureError::Configuration(_))));
        assert_eq!(configured.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refused_initialization_is_a_capture_error() {
        let sensor = ScriptedSensor::new(16).refuse_configuration("sensor not detected");
        let result =
            FrameSource::start(Box::new(sensor), &CameraConfig::default(), CancellationToken::new())
                .await;
        assert!(matches!(result, Err(ApertureError::Capture(_))));
    }
}
