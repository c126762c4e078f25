//! Operational helpers: logging, pipeline counters, host probing.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Instant,
};

use aperture_types::{config::OpsConfig, status::SensorInfo, ApertureError, Result};
use serde::Serialize;
use sysinfo::System;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_tracing(config: &OpsConfig) -> Result<()> {
    let filter = EnvFilter::try_new(config.log_level.clone())
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| ApertureError::Ops(format!("failed to create log filter: {err}")))?;

    fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| ApertureError::Ops(format!("tracing init error: {err}")))?;
    Ok(())
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    active_sessions: AtomicU64,
    total_sessions: AtomicU64,
    capture_faults: AtomicU64,
    transport_faults: AtomicU64,
    /// Latest rate estimate of each live session, keyed by its ticket.
    session_fps: Mutex<HashMap<u64, f64>>,
}

impl Counters {
    fn session_fps(&self) -> MutexGuard<'_, HashMap<u64, f64>> {
        self.session_fps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Identifies one session's contribution to the shared counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionTicket(u64);

/// Process-wide streaming counters shared by every session.
#[derive(Clone)]
pub struct Telemetry {
    counters: Arc<Counters>,
    started: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub uptime_secs: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub active_sessions: u64,
    pub total_sessions: u64,
    pub capture_faults: u64,
    pub transport_faults: u64,
    /// Sum of the live sessions' delivery rates.
    pub measured_fps: f64,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            started: Instant::now(),
        }
    }

    pub fn session_started(&self) -> SessionTicket {
        self.counters.active_sessions.fetch_add(1, Ordering::Relaxed);
        let ticket = self.counters.total_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        SessionTicket(ticket)
    }

    /// Drops the session from the active count and from the aggregate rate.
    pub fn session_ended(&self, ticket: SessionTicket) {
        self.counters.session_fps().remove(&ticket.0);
        let _ = self.counters.active_sessions.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |active| active.checked_sub(1),
        );
    }

    pub fn frame_sent(&self, bytes: usize) {
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn capture_fault(&self) {
        self.counters.capture_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_fault(&self) {
        self.counters.transport_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Replace this session's rate estimate.
    pub fn record_fps(&self, ticket: SessionTicket, fps: f64) {
        self.counters.session_fps().insert(ticket.0, fps);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let c = &self.counters;
        TelemetrySnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            active_sessions: c.active_sessions.load(Ordering::Relaxed),
            total_sessions: c.total_sessions.load(Ordering::Relaxed),
            capture_faults: c.capture_faults.load(Ordering::Relaxed),
            transport_faults: c.transport_faults.load(Ordering::Relaxed),
            measured_fps: c.session_fps().values().sum(),
        }
    }
}

/// Host facts logged at boot and surfaced on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub os: &'static str,
    pub arch: &'static str,
    pub cores: usize,
    pub total_memory_bytes: Option<u64>,
    pub free_memory_bytes: Option<u64>,
}

pub fn probe_host() -> HostInfo {
    let mut sys = System::new();
    sys.refresh_memory();
    HostInfo {
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        cores: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        total_memory_bytes: reported(sys.total_memory()),
        free_memory_bytes: reported(sys.available_memory()),
    }
}

/// Free memory right now, when the platform reports it.
pub fn free_memory_bytes() -> Option<u64> {
    let mut sys = System::new();
    sys.refresh_memory();
    reported(sys.available_memory())
}

/// sysinfo reports zero on platforms it cannot read.
fn reported(bytes: u64) -> Option<u64> {
    (bytes > 0).then_some(bytes)
}

pub fn log_device_info(host: &HostInfo, sensor: &SensorInfo) {
    info!(
        "Host: {} {}, cores: {}",
        host.os, host.arch, host.cores
    );
    match host.total_memory_bytes {
        Some(total) => info!("Memory: {}MB", total / (1024 * 1024)),
        None => warn!("Memory size not available on this platform"),
    }
    info!(
        "Sensor: {}, frame size: {}, quality: {}",
        sensor.model, sensor.frame_size, sensor.jpeg_quality
    );
}
