use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::{config::GrabPolicy, frame::FrameSize, link::LinkState};

/// Identity reported by the capture collaborator after configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorInfo {
    pub model: String,
    pub frame_size: FrameSize,
    pub jpeg_quality: u8,
}

/// Slot accounting at a single instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOccupancy {
    pub capacity: usize,
    pub free: usize,
    pub filling: usize,
    pub ready: usize,
    pub checked_out: usize,
}

/// Flat document served on `/status`. Read-only; building it has no side effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub uptime_secs: u64,
    pub free_memory_bytes: Option<u64>,
    /// Sum of the live sessions' delivery rates.
    pub measured_fps: f64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub active_sessions: u64,
    pub total_sessions: u64,
    pub capture_faults: u64,
    pub transport_faults: u64,
    pub frames_dropped: u64,
    pub pool_capacity: usize,
    pub pool_free: usize,
    pub pool_ready: usize,
    pub pool_checked_out: usize,
    pub grab_policy: GrabPolicy,
    pub sensor_model: String,
    pub frame_size: FrameSize,
    pub jpeg_quality: u8,
    pub link_state: LinkState,
    pub link_address: Option<IpAddr>,
}
