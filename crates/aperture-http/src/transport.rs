use std::convert::Infallible;

use aperture_stream::{StreamTransport, TransportError};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    time::{timeout, Duration},
};
use tracing::error;

/// Chunks buffered between the session and the HTTP body.
const CHUNK_QUEUE_DEPTH: usize = 4;

/// Session side of a streaming response: chunks go into an axum body.
pub struct ChannelTransport {
    negotiated: Option<oneshot::Sender<String>>,
    chunks: Option<mpsc::Sender<Bytes>>,
    send_timeout: Duration,
}

/// Handler side: becomes the response once the session announces its content type.
pub struct PendingResponse {
    negotiated: oneshot::Receiver<String>,
    chunks: mpsc::Receiver<Bytes>,
}

pub fn channel_transport(send_timeout: Duration) -> (ChannelTransport, PendingResponse) {
    let (negotiated_tx, negotiated_rx) = oneshot::channel();
    let (chunks_tx, chunks_rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
    (
        ChannelTransport {
            negotiated: Some(negotiated_tx),
            chunks: Some(chunks_tx),
            send_timeout,
        },
        PendingResponse {
            negotiated: negotiated_rx,
            chunks: chunks_rx,
        },
    )
}

#[async_trait]
impl StreamTransport for ChannelTransport {
    async fn open(&mut self, content_type: &str) -> Result<(), TransportError> {
        let negotiated = self
            .negotiated
            .take()
            .ok_or_else(|| TransportError::Io("response already started".into()))?;
        negotiated
            .send(content_type.to_string())
            .map_err(|_| TransportError::Closed)
    }

    async fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        let chunks = self.chunks.as_ref().ok_or(TransportError::Closed)?;
        match timeout(self.send_timeout, chunks.send(Bytes::copy_from_slice(chunk))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::TimedOut(self.send_timeout)),
        }
    }

    fn is_peer_alive(&self) -> bool {
        self.chunks.as_ref().is_some_and(|chunks| !chunks.is_closed())
    }

    async fn close(&mut self) {
        self.chunks = None;
        self.negotiated = None;
    }
}

impl PendingResponse {
    /// Wait for the session to open the response. A session that ends first
    /// leaves the client with `503`.
    pub async fn into_response(self) -> Response {
        let Ok(content_type) = self.negotiated.await else {
            return (StatusCode::SERVICE_UNAVAILABLE, "stream unavailable\n").into_response();
        };

        let mut chunks = self.chunks;
        let body = Body::from_stream(async_stream::stream! {
            while let Some(chunk) = chunks.recv().await {
                yield Ok::<_, Infallible>(chunk);
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .header(header::PRAGMA, "no-cache")
            .body(body)
            .unwrap_or_else(|err| {
                error!("Failed to build stream response: {err}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn chunks_flow_into_the_body_in_order() {
        let (mut transport, pending) = channel_transport(Duration::from_secs(1));
        let writer = tokio::spawn(async move {
            transport.open("multipart/x-mixed-replace; boundary=frame").await?;
            for chunk in [&b"one"[..], b"two", b"three"] {
                transport.send_chunk(chunk).await?;
            }
            transport.close().await;
            Ok::<_, TransportError>(())
        });

        let response = pending.into_response().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"onetwothree");
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn session_gone_before_open_is_unavailable() {
        let (transport, pending) = channel_transport(Duration::from_secs(1));
        drop(transport);
        let response = pending.into_response().await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn dropped_body_reads_as_dead_peer() {
        let (mut transport, pending) = channel_transport(Duration::from_secs(1));
        transport.open("text/plain").await.unwrap();
        assert!(transport.is_peer_alive());

        drop(pending.into_response().await);
        assert!(!transport.is_peer_alive());
        assert_eq!(transport.send_chunk(b"x").await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn stalled_reader_times_out() {
        let (mut transport, _pending) = channel_transport(Duration::from_millis(20));
        for _ in 0..CHUNK_QUEUE_DEPTH {
            transport.send_chunk(b"x").await.unwrap();
        }
        assert_eq!(
            transport.send_chunk(b"x").await,
            Err(TransportError::TimedOut(Duration::from_millis(20)))
        );
    }
}
