use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One JPEG bitstream captured by the sensor.
///
/// Frames are move-only: whoever holds one owns the underlying buffer until it
/// goes back to the pool it came from.
pub struct Frame {
    data: Vec<u8>,
    sequence: u64,
    captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(data: Vec<u8>, sequence: u64, captured_at: DateTime<Utc>) -> Self {
        Self {
            data,
            sequence,
            captured_at,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Give the buffer back so the pool can reuse its allocation.
    pub fn into_buffer(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

/// Sensor output resolutions supported by the camera module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameSize {
    Qqvga,
    Hqvga,
    Qvga,
    Cif,
    Vga,
    Svga,
    Xga,
    Sxga,
    Uxga,
}

impl FrameSize {
    pub const ALL: [FrameSize; 9] = [
        FrameSize::Qqvga,
        FrameSize::Hqvga,
        FrameSize::Qvga,
        FrameSize::Cif,
        FrameSize::Vga,
        FrameSize::Svga,
        FrameSize::Xga,
        FrameSize::Sxga,
        FrameSize::Uxga,
    ];

    pub fn dimensions(self) -> (u32, u32) {
        match self {
            FrameSize::Qqvga => (160, 120),
            FrameSize::Hqvga => (240, 176),
            FrameSize::Qvga => (320, 240),
            FrameSize::Cif => (400, 296),
            FrameSize::Vga => (640, 480),
            FrameSize::Svga => (800, 600),
            FrameSize::Xga => (1024, 768),
            FrameSize::Sxga => (1280, 1024),
            FrameSize::Uxga => (1600, 1200),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameSize::Qqvga => "QQVGA",
            FrameSize::Hqvga => "HQVGA",
            FrameSize::Qvga => "QVGA",
            FrameSize::Cif => "CIF",
            FrameSize::Vga => "VGA",
            FrameSize::Svga => "SVGA",
            FrameSize::Xga => "XGA",
            FrameSize::Sxga => "SXGA",
            FrameSize::Uxga => "UXGA",
        }
    }

    pub fn from_name(name: &str) -> Option<FrameSize> {
        let wanted = name.trim();
        Self::ALL
            .into_iter()
            .find(|size| size.name().eq_ignore_ascii_case(wanted))
    }

    /// Unknown names fall back to SVGA, the default frame size.
    pub fn from_name_lenient(name: &str) -> FrameSize {
        Self::from_name(name).unwrap_or_else(|| {
            warn!("Unknown frame size '{}', falling back to SVGA", name);
            FrameSize::Svga
        })
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (width, height) = self.dimensions();
        write!(f, "{} ({width}x{height})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_reports_length_and_sequence() {
        let frame = Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 7, Utc::now());
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.sequence(), 7);
        assert!(!frame.is_empty());
        assert_eq!(frame.into_buffer(), vec![0xFF, 0xD8, 0xFF, 0xD9]);
    }

    #[test]
    fn frame_size_names_round_trip() {
        for size in FrameSize::ALL {
            assert_eq!(FrameSize::from_name(size.name()), Some(size));
        }
        assert_eq!(FrameSize::from_name("vga"), Some(FrameSize::Vga));
    }

    #[test]
    fn unknown_frame_size_falls_back_to_svga() {
        assert_eq!(FrameSize::from_name_lenient("8K"), FrameSize::Svga);
        assert_eq!(FrameSize::Svga.dimensions(), (800, 600));
    }
}
