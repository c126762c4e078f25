use std::fmt;

use aperture_capture::{FrameSource, Unavailable};
use aperture_ops::{SessionTicket, Telemetry};
use aperture_types::{config::StreamConfig, frame::Frame};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    part::{part_header, PartDiagnostics, BOUNDARY_MARKER, STREAM_CONTENT_TYPE},
    Pacer, StreamTransport, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Start,
    Streaming,
    SendBoundary,
    SendHeader,
    SendPayload,
    Ended,
}

/// Which write of a part failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStep {
    Boundary,
    Header,
    Payload,
}

impl fmt::Display for SendStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SendStep::Boundary => "boundary",
            SendStep::Header => "header",
            SendStep::Payload => "payload",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Response headers could not be sent.
    NegotiationFailed(TransportError),
    PeerGone,
    CaptureFault(String),
    SourceStopped,
    TransportFault { step: SendStep, error: TransportError },
    Cancelled,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::NegotiationFailed(err) => write!(f, "response setup failed: {err}"),
            EndReason::PeerGone => f.write_str("client disconnected"),
            EndReason::CaptureFault(reason) => write!(f, "capture failed: {reason}"),
            EndReason::SourceStopped => f.write_str("frame source stopped"),
            EndReason::TransportFault { step, error } => {
                write!(f, "sending {step} failed: {error}")
            }
            EndReason::Cancelled => f.write_str("shutting down"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub pacing: Duration,
    pub diagnostic_headers: bool,
}

impl From<&StreamConfig> for SessionOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            pacing: config.pacing(),
            diagnostic_headers: config.diagnostic_headers,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: Uuid,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub last_sequence: Option<u64>,
    pub measured_fps: f64,
    pub reason: EndReason,
}

/// One client's MJPEG stream, from response setup until the client or the
/// pipeline goes away.
pub struct StreamSession<T> {
    id: Uuid,
    transport: T,
    options: SessionOptions,
    telemetry: Telemetry,
    state: SessionState,
    pacer: Pacer,
    frames_sent: u64,
    bytes_sent: u64,
    last_sequence: Option<u64>,
}

impl<T: StreamTransport> StreamSession<T> {
    pub fn new(transport: T, options: SessionOptions, telemetry: Telemetry) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            options,
            telemetry,
            state: SessionState::Start,
            pacer: Pacer::new(options.pacing),
            frames_sent: 0,
            bytes_sent: 0,
            last_sequence: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Stream until the session ends. Every acquired frame is released before
    /// this returns.
    pub async fn run(mut self, source: &FrameSource, cancel: &CancellationToken) -> SessionSummary {
        let ticket = self.telemetry.session_started();
        info!(session = %self.id, "Starting camera stream");

        let reason = self.stream(source, cancel, ticket).await;
        self.state = SessionState::Ended;
        self.transport.close().await;
        self.telemetry.session_ended(ticket);

        match &reason {
            EndReason::CaptureFault(_) | EndReason::TransportFault { .. } => {
                warn!(session = %self.id, frames = self.frames_sent, "Stream ended: {reason}")
            }
            _ => info!(session = %self.id, frames = self.frames_sent, "Stream ended: {reason}"),
        }

        SessionSummary {
            id: self.id,
            frames_sent: self.frames_sent,
            bytes_sent: self.bytes_sent,
            last_sequence: self.last_sequence,
            measured_fps: self.pacer.fps(),
            reason,
        }
    }

    async fn stream(
        &mut self,
        source: &FrameSource,
        cancel: &CancellationToken,
        ticket: SessionTicket,
    ) -> EndReason {
        if let Err(err) = self.transport.open(STREAM_CONTENT_TYPE).await {
            return EndReason::NegotiationFailed(err);
        }
        self.state = SessionState::Streaming;

        loop {
            if cancel.is_cancelled() {
                return EndReason::Cancelled;
            }
            if !self.transport.is_peer_alive() {
                return EndReason::PeerGone;
            }

            let acquired = tokio::select! {
                _ = cancel.cancelled() => return EndReason::Cancelled,
                acquired = source.acquire() => acquired,
            };
            let lease = match acquired {
                Ok(lease) => lease,
                Err(Unavailable::Fault(reason)) => {
                    error!(session = %self.id, "Camera capture failed: {reason}");
                    self.telemetry.capture_fault();
                    return EndReason::CaptureFault(reason);
                }
                Err(Unavailable::Stopped) => return EndReason::SourceStopped,
            };
            debug_assert!(self.last_sequence.map_or(true, |last| lease.sequence() > last));

            let sent = self.send_part(&lease).await;
            let (sequence, len) = (lease.sequence(), lease.len());
            source.release(lease);
            if let Err((step, error)) = sent {
                self.telemetry.transport_fault();
                return EndReason::TransportFault { step, error };
            }

            self.state = SessionState::Streaming;
            self.frames_sent += 1;
            self.bytes_sent += len as u64;
            self.last_sequence = Some(sequence);
            self.pacer.record_send(Instant::now());
            self.telemetry.frame_sent(len);
            self.telemetry.record_fps(ticket, self.pacer.fps());
            debug!(session = %self.id, sequence, len, "part sent");

            tokio::select! {
                _ = cancel.cancelled() => return EndReason::Cancelled,
                _ = self.pacer.pause() => {}
            }
        }
    }

    async fn send_part(&mut self, frame: &Frame) -> Result<(), (SendStep, TransportError)> {
        self.state = SessionState::SendBoundary;
        self.transport
            .send_chunk(BOUNDARY_MARKER)
            .await
            .map_err(|err| (SendStep::Boundary, err))?;

        self.state = SessionState::SendHeader;
        let diagnostics = self.options.diagnostic_headers.then(|| PartDiagnostics {
            sequence: frame.sequence(),
            captured_at: frame.captured_at(),
            fps: self.pacer.fps(),
        });
        let header = part_header(frame.len(), diagnostics.as_ref());
        self.transport
            .send_chunk(header.as_bytes())
            .await
            .map_err(|err| (SendStep::Header, err))?;

        self.state = SessionState::SendPayload;
        self.transport
            .send_chunk(frame.bytes())
            .await
            .map_err(|err| (SendStep::Payload, err))
    }
}
