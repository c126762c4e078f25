//! HTTP front end: landing page, MJPEG stream, and status document.

mod transport;

use std::sync::Arc;

use aperture_capture::FrameSource;
use aperture_link::LinkHandle;
use aperture_ops::{free_memory_bytes, Telemetry};
use aperture_stream::{SessionOptions, StreamSession};
use aperture_types::{
    config::ApertureConfig, status::StatusReport, ApertureError, Result,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::{net::TcpListener, sync::Semaphore, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use transport::{channel_transport, ChannelTransport, PendingResponse};

const INDEX_HTML: &str = "<html><head><title>Aperture Camera</title></head>\
<body><img src=\"/stream\" style=\"width:100%;\"></body></html>";

pub fn http_error(msg: impl Into<String>) -> ApertureError {
    ApertureError::Http(msg.into())
}

/// Everything a request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    source: Arc<FrameSource>,
    telemetry: Telemetry,
    link: LinkHandle,
    sessions: Arc<Semaphore>,
    max_sessions: usize,
    session_options: SessionOptions,
    send_timeout: Duration,
    cancel: CancellationToken,
}

impl AppState {
    pub fn new(
        source: Arc<FrameSource>,
        telemetry: Telemetry,
        link: LinkHandle,
        config: &ApertureConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            telemetry,
            link,
            sessions: Arc::new(Semaphore::new(config.stream.max_sessions)),
            max_sessions: config.stream.max_sessions,
            session_options: SessionOptions::from(&config.stream),
            send_timeout: config.http.send_timeout(),
            cancel,
        }
    }

    pub fn status_report(&self) -> StatusReport {
        let counters = self.telemetry.snapshot();
        let pool = self.source.stats();
        let sensor = self.source.sensor();
        let link = self.link.status();
        StatusReport {
            uptime_secs: counters.uptime_secs,
            free_memory_bytes: free_memory_bytes(),
            measured_fps: counters.measured_fps,
            frames_sent: counters.frames_sent,
            bytes_sent: counters.bytes_sent,
            active_sessions: counters.active_sessions,
            total_sessions: counters.total_sessions,
            capture_faults: counters.capture_faults,
            transport_faults: counters.transport_faults,
            frames_dropped: pool.dropped,
            pool_capacity: pool.occupancy.capacity,
            pool_free: pool.occupancy.free,
            pool_ready: pool.occupancy.ready,
            pool_checked_out: pool.occupancy.checked_out,
            grab_policy: self.source.policy(),
            sensor_model: sensor.model.clone(),
            frame_size: sensor.frame_size,
            jpeg_quality: sensor.jpeg_quality,
            link_state: link.state,
            link_address: link.address,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream", get(stream))
        .route("/status", get(status))
        .with_state(state)
}

/// Bind the configured listen address.
pub async fn bind(config: &ApertureConfig) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.http.bind_addr, config.http.port);
    TcpListener::bind(&addr)
        .await
        .map_err(|err| http_error(format!("failed to bind {addr}: {err}")))
}

/// Serve until `cancel` fires and every open stream has finished.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let port = listener
        .local_addr()
        .map_err(|err| http_error(format!("listener has no address: {err}")))?
        .port();
    let cancel = state.cancel.clone();
    info!("HTTP server started on port {}", port);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| http_error(format!("server error: {err}")))?;
    info!("HTTP server stopped");
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.status_report())
}

async fn stream(State(state): State<AppState>) -> Response {
    let Ok(permit) = state.sessions.clone().try_acquire_owned() else {
        warn!(
            "Rejecting stream request: {} sessions already active",
            state.max_sessions
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "too many active streams\n").into_response();
    };

    let (transport, pending) = channel_transport(state.send_timeout);
    let session = StreamSession::new(transport, state.session_options, state.telemetry.clone());
    let source = state.source.clone();
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        let _permit = permit;
        session.run(&source, &cancel).await;
    });

    pending.into_response().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_capture::ScriptedSensor;
    use aperture_link::{ConnectivityMonitor, ScriptedAttachment};
    use axum::{
        body::Body,
        http::{header, Request},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Fixture {
        state: AppState,
        source: Arc<FrameSource>,
        _monitor: ConnectivityMonitor,
    }

    async fn fixture(max_sessions: usize) -> Fixture {
        let mut config = ApertureConfig::default();
        config.camera.buffer_count = 2;
        config.stream.pacing_ms = 0;
        config.stream.max_sessions = max_sessions;

        let cancel = CancellationToken::new();
        let source = Arc::new(
            FrameSource::start(Box::new(ScriptedSensor::new(256)), &config.camera, cancel.clone())
                .await
                .expect("start source"),
        );
        let (attachment, _events, rx) = ScriptedAttachment::new();
        let monitor =
            ConnectivityMonitor::start(Arc::new(attachment), rx, &config.link, cancel.clone())
                .await
                .expect("start monitor");
        let state = AppState::new(
            source.clone(),
            Telemetry::new(),
            monitor.handle(),
            &config,
            cancel,
        );
        Fixture {
            state,
            source,
            _monitor: monitor,
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn index_embeds_the_stream() {
        let fx = fixture(1).await;
        let response = router(fx.state).oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(std::str::from_utf8(&body).unwrap().contains("<img src=\"/stream\""));
    }

    #[tokio::test]
    async fn stream_starts_with_a_jpeg_part() {
        let fx = fixture(1).await;
        let response = router(fx.state).oneshot(get("/stream")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let mut body = response.into_body();
        let mut wire = Vec::new();
        while wire.len() < 256 + 64 {
            let frame = body.frame().await.expect("body open").unwrap();
            if let Ok(data) = frame.into_data() {
                wire.extend_from_slice(&data);
            }
        }
        assert!(wire.starts_with(b"\r\n--frame\r\nContent-Type: image/jpeg\r\nContent-Length: "));
        let header_end = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        assert_eq!(&wire[header_end + 4..header_end + 6], &[0xFF, 0xD8]);
        fx.source.shutdown().await;
    }

    #[tokio::test]
    async fn extra_streams_are_rejected() {
        let fx = fixture(1).await;
        let app = router(fx.state.clone());

        let first = app.clone().oneshot(get("/stream")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.clone().oneshot(get("/stream")).await.unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);

        drop(first);
        let mut admitted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if fx.state.sessions.available_permits() == 1 {
                admitted = true;
                break;
            }
        }
        assert!(admitted, "permit returned after the client left");
        fx.source.shutdown().await;
    }

    #[tokio::test]
    async fn status_reports_pipeline_and_link() {
        let fx = fixture(2).await;
        let response = router(fx.state).oneshot(get("/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc["pool_capacity"], 2);
        assert_eq!(doc["sensor_model"], "scripted");
        assert_eq!(doc["grab_policy"], "when_empty");
        assert_eq!(doc["link_state"], "disconnected");
        assert_eq!(doc["active_sessions"], 0);
        fx.source.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let fx = fixture(1).await;
        let response = router(fx.state).oneshot(get("/capture")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
