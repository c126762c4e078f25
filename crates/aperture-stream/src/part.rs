//! Multipart framing for `multipart/x-mixed-replace` responses.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

pub const BOUNDARY: &str = "frame";
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
/// Written before every part, including the first.
pub const BOUNDARY_MARKER: &[u8] = b"\r\n--frame\r\n";

/// Extra headers that ride along with a part; decoders ignore them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartDiagnostics {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub fps: f64,
}

/// Header block for a JPEG part of `len` bytes, including the blank line.
pub fn part_header(len: usize, diagnostics: Option<&PartDiagnostics>) -> String {
    let mut header = format!("Content-Type: image/jpeg\r\nContent-Length: {len}");
    if let Some(diag) = diagnostics {
        let _ = write!(
            header,
            "\r\nX-Frame-Sequence: {}\r\nX-Timestamp: {}.{:06}\r\nX-Frame-Rate: {:.1}",
            diag.sequence,
            diag.captured_at.timestamp(),
            diag.captured_at.timestamp_subsec_micros(),
            diag.fps
        );
    }
    header.push_str("\r\n\r\n");
    header
}
