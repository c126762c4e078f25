use std::{collections::HashSet, fmt, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{frame::FrameSize, ApertureError, Result};

/// Highest GPIO number on the camera board.
pub const MAX_GPIO: u8 = 48;
pub const MAX_BUFFER_COUNT: usize = 4;
pub const MAX_JPEG_QUALITY: u8 = 63;
const XCLK_RANGE_HZ: std::ops::RangeInclusive<u32> = 1_000_000..=40_000_000;

/// Sensor wiring. PWDN and RESET are optional on most boards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    /// D0 through D7, in bus order.
    pub data: [u8; 8],
    pub xclk: u8,
    pub pclk: u8,
    pub vsync: u8,
    pub href: u8,
    pub sccb_sda: u8,
    pub sccb_scl: u8,
    pub pwdn: Option<u8>,
    pub reset: Option<u8>,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            data: [11, 9, 8, 10, 12, 18, 17, 16],
            xclk: 15,
            pclk: 13,
            vsync: 6,
            href: 7,
            sccb_sda: 4,
            sccb_scl: 5,
            pwdn: None,
            reset: None,
        }
    }
}

impl PinConfig {
    fn assigned(&self) -> impl Iterator<Item = (&'static str, u8)> + '_ {
        const DATA: [&str; 8] = ["d0", "d1", "d2", "d3", "d4", "d5", "d6", "d7"];
        DATA.into_iter()
            .zip(self.data.iter().copied())
            .chain([
                ("xclk", self.xclk),
                ("pclk", self.pclk),
                ("vsync", self.vsync),
                ("href", self.href),
                ("sccb_sda", self.sccb_sda),
                ("sccb_scl", self.sccb_scl),
            ])
            .chain(self.pwdn.map(|pin| ("pwdn", pin)))
            .chain(self.reset.map(|pin| ("reset", pin)))
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (name, pin) in self.assigned() {
            if pin > MAX_GPIO {
                return Err(ApertureError::Configuration(format!(
                    "camera.pins.{name} uses GPIO {pin}, above the maximum of {MAX_GPIO}"
                )));
            }
            if !seen.insert(pin) {
                return Err(ApertureError::Configuration(format!(
                    "camera.pins.{name} reuses GPIO {pin}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Jpeg,
    Rgb565,
    Grayscale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferLocation {
    Psram,
    Dram,
}

/// Which completed frame `acquire` hands out when several are waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabPolicy {
    /// Deliver frames in capture order; capture stalls while every slot is full.
    WhenEmpty,
    /// Deliver the newest frame and recycle anything older.
    Latest,
}

impl fmt::Display for GrabPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrabPolicy::WhenEmpty => f.write_str("when_empty"),
            GrabPolicy::Latest => f.write_str("latest"),
        }
    }
}

impl std::str::FromStr for GrabPolicy {
    type Err = ApertureError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "when_empty" => Ok(GrabPolicy::WhenEmpty),
            "latest" | "grab_latest" => Ok(GrabPolicy::Latest),
            other => Err(ApertureError::Configuration(format!(
                "unknown grab policy '{other}' (expected when_empty or latest)"
            ))),
        }
    }
}

/// Everything the capture collaborator needs, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub xclk_freq_hz: u32,
    pub pixel_format: PixelFormat,
    pub frame_size: FrameSize,
    /// 0-63, lower means better quality.
    pub jpeg_quality: u8,
    pub buffer_count: usize,
    pub buffer_location: BufferLocation,
    pub grab_policy: GrabPolicy,
    /// Interval between captures for sensors that free-run.
    pub sensor_interval_ms: u64,
    pub pins: PinConfig,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            pins: PinConfig::default(),
            xclk_freq_hz: 20_000_000,
            pixel_format: PixelFormat::Jpeg,
            frame_size: FrameSize::Svga,
            jpeg_quality: 12,
            buffer_count: 1,
            buffer_location: BufferLocation::Psram,
            grab_policy: GrabPolicy::WhenEmpty,
            sensor_interval_ms: 40,
        }
    }
}

impl CameraConfig {
    pub fn validate(&self) -> Result<()> {
        self.pins.validate()?;
        if !XCLK_RANGE_HZ.contains(&self.xclk_freq_hz) {
            return Err(ApertureError::Configuration(format!(
                "camera.xclk_freq_hz must be within {}..={} Hz",
                XCLK_RANGE_HZ.start(),
                XCLK_RANGE_HZ.end()
            )));
        }
        if self.pixel_format != PixelFormat::Jpeg {
            return Err(ApertureError::Configuration(
                "camera.pixel_format must be jpeg for MJPEG streaming".into(),
            ));
        }
        if self.jpeg_quality > MAX_JPEG_QUALITY {
            return Err(ApertureError::Configuration(format!(
                "camera.jpeg_quality must be between 0 and {MAX_JPEG_QUALITY}"
            )));
        }
        if !(1..=MAX_BUFFER_COUNT).contains(&self.buffer_count) {
            return Err(ApertureError::Configuration(format!(
                "camera.buffer_count must be between 1 and {MAX_BUFFER_COUNT}"
            )));
        }
        Ok(())
    }

    pub fn sensor_interval(&self) -> Duration {
        Duration::from_millis(self.sensor_interval_ms)
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Reconnect delay; a zero base reconnects immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub poll_interval_ms: u64,
    pub max_wait_attempts: u32,
    pub credentials: Credentials,
    pub backoff: BackoffConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials {
                ssid: "aperture".into(),
                password: String::new(),
            },
            poll_interval_ms: 500,
            max_wait_attempts: 20,
            backoff: BackoffConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub pacing_ms: u64,
    pub diagnostic_headers: bool,
    pub max_sessions: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pacing_ms: 30,
            diagnostic_headers: true,
            max_sessions: 2,
        }
    }
}

impl StreamConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_addr: String,
    pub port: u16,
    pub send_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 80,
            send_timeout_ms: 5_000,
        }
    }
}

impl HttpConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub log_level: String,
    pub heartbeat_secs: u64,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            heartbeat_secs: 10,
        }
    }
}

impl OpsConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApertureConfig {
    pub camera: CameraConfig,
    pub link: LinkConfig,
    pub stream: StreamConfig,
    pub http: HttpConfig,
    pub ops: OpsConfig,
}

impl ApertureConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|err| {
            ApertureError::Configuration(format!(
                "unable to read config file {}: {err}",
                path_ref.display()
            ))
        })?;
        toml::from_str(&contents).map_err(|err| {
            ApertureError::Configuration(format!(
                "failed to parse config file {}: {err}",
                path_ref.display()
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.camera.validate()?;
        if self.link.credentials.ssid.is_empty() {
            return Err(ApertureError::Configuration(
                "link.credentials.ssid must not be empty".into(),
            ));
        }
        if self.link.poll_interval_ms == 0 || self.link.max_wait_attempts == 0 {
            return Err(ApertureError::Configuration(
                "link.poll_interval_ms and link.max_wait_attempts must be greater than zero"
                    .into(),
            ));
        }
        if self.link.backoff.base_ms > self.link.backoff.max_ms {
            return Err(ApertureError::Configuration(
                "link.backoff.base_ms must not exceed link.backoff.max_ms".into(),
            ));
        }
        if self.stream.max_sessions == 0 {
            return Err(ApertureError::Configuration(
                "stream.max_sessions must be greater than zero".into(),
            ));
        }
        if self.http.send_timeout_ms == 0 {
            return Err(ApertureError::Configuration(
                "http.send_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.ops.heartbeat_secs == 0 {
            return Err(ApertureError::Configuration(
                "ops.heartbeat_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
