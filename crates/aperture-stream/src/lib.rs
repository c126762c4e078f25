//! Per-client MJPEG streaming: multipart framing, pacing, and the session loop.

mod pacing;
mod part;
mod session;
mod transport;

pub use pacing::Pacer;
pub use part::{part_header, PartDiagnostics, BOUNDARY, BOUNDARY_MARKER, STREAM_CONTENT_TYPE};
pub use session::{EndReason, SendStep, SessionOptions, SessionState, SessionSummary, StreamSession};
pub use transport::{StreamTransport, TransportError};
