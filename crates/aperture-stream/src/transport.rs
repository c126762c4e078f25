use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer closed the connection")]
    Closed,
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
    #[error("transport failure: {0}")]
    Io(String),
}

/// Client connection as seen by a stream session.
#[async_trait]
pub trait StreamTransport: Send {
    /// Announce the response content type. Called once, before any chunk.
    async fn open(&mut self, content_type: &str) -> Result<(), TransportError>;

    async fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Non-blocking, best-effort check that the client is still there.
    fn is_peer_alive(&self) -> bool;

    async fn close(&mut self);
}
