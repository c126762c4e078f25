//! Boot sequence and idle loop tying the link, camera, and web server together.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use aperture_capture::{CaptureDevice, FrameSource};
use aperture_http::{bind, serve, AppState};
use aperture_link::{ConnectivityMonitor, LinkEvent, NetworkAttachment};
use aperture_ops::{log_device_info, probe_host, Telemetry};
use aperture_types::{config::ApertureConfig, ApertureError, Result};
use tokio::{
    net::TcpListener,
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub fn orchestrator_error(message: impl Into<String>) -> ApertureError {
    ApertureError::Orchestrator(message.into())
}

/// Collaborators the appliance drives. Supplied by the binary or a test.
pub struct Peripherals {
    pub camera: Box<dyn CaptureDevice>,
    pub attachment: Arc<dyn NetworkAttachment>,
    pub link_events: mpsc::Receiver<LinkEvent>,
}

pub struct Appliance {
    config: ApertureConfig,
    telemetry: Telemetry,
    cancel: CancellationToken,
}

impl Appliance {
    pub fn new(config: ApertureConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            telemetry: Telemetry::new(),
            cancel,
        }
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Link first, then camera, then web server. Any failure is fatal and
    /// leaves nothing running.
    pub async fn start(&self, peripherals: Peripherals) -> Result<Running> {
        let Peripherals {
            camera,
            attachment,
            link_events,
        } = peripherals;

        info!("Booting camera appliance...");
        self.config.validate()?;
        let host = probe_host();

        let monitor =
            ConnectivityMonitor::start(attachment, link_events, &self.config.link, self.cancel.clone())
                .await?;
        let link = monitor.handle();
        let address = match link
            .wait_for_connection(self.config.link.poll_interval(), self.config.link.max_wait_attempts)
            .await
        {
            Ok(address) => address,
            Err(err) => {
                error!("Network connection failed");
                monitor.shutdown().await;
                return Err(err);
            }
        };

        let source = match FrameSource::start(camera, &self.config.camera, self.cancel.clone()).await {
            Ok(source) => Arc::new(source),
            Err(err) => {
                error!("Camera init failed: {err}");
                monitor.shutdown().await;
                return Err(err);
            }
        };
        log_device_info(&host, source.sensor());

        let (listener, local_addr) = match listen(&self.config).await {
            Ok(bound) => bound,
            Err(err) => {
                error!("Failed to start HTTP server: {err}");
                source.shutdown().await;
                monitor.shutdown().await;
                return Err(err);
            }
        };

        let state = AppState::new(
            source.clone(),
            self.telemetry.clone(),
            link,
            &self.config,
            self.cancel.clone(),
        );
        let server = tokio::spawn(serve(listener, state));
        info!(
            "Setup complete! Access the camera stream at http://{}:{}/",
            address,
            local_addr.port()
        );

        Ok(Running {
            monitor,
            source,
            server,
            local_addr,
            link_address: address,
            telemetry: self.telemetry.clone(),
            heartbeat: self.config.ops.heartbeat(),
            cancel: self.cancel.clone(),
        })
    }
}

async fn listen(config: &ApertureConfig) -> Result<(TcpListener, SocketAddr)> {
    let listener = bind(config).await?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| orchestrator_error(format!("listener has no address: {err}")))?;
    Ok((listener, local_addr))
}

/// A booted appliance. Serves until its cancellation token fires.
pub struct Running {
    monitor: ConnectivityMonitor,
    source: Arc<FrameSource>,
    server: JoinHandle<Result<()>>,
    local_addr: SocketAddr,
    link_address: IpAddr,
    telemetry: Telemetry,
    heartbeat: Duration,
    cancel: CancellationToken,
}

impl Running {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn link_address(&self) -> IpAddr {
        self.link_address
    }

    /// Idle until cancelled, logging a heartbeat, then stop everything.
    pub async fn run(self) -> Result<()> {
        let mut ticker = interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snap = self.telemetry.snapshot();
                    let link = self.monitor.handle().status();
                    info!(
                        uptime_secs = snap.uptime_secs,
                        active_sessions = snap.active_sessions,
                        frames_sent = snap.frames_sent,
                        fps = snap.measured_fps,
                        link = %link.state,
                        "heartbeat"
                    );
                }
            }
        }

        info!("Shutting down");
        let served = match self.server.await {
            Ok(served) => served,
            Err(err) => Err(orchestrator_error(format!("HTTP server task failed: {err}"))),
        };
        self.source.shutdown().await;
        self.monitor.shutdown().await;
        if let Err(err) = &served {
            warn!("HTTP server ended with an error: {err}");
        }
        served
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_capture::ScriptedSensor;
    use aperture_link::{LoopbackAttachment, ScriptedAttachment};
    use std::{net::Ipv4Addr, sync::atomic::Ordering};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        time::timeout,
    };

    fn config() -> ApertureConfig {
        let mut config = ApertureConfig::default();
        config.http.bind_addr = "127.0.0.1".into();
        config.http.port = 0;
        config.link.poll_interval_ms = 5;
        config.stream.pacing_ms = 0;
        config
    }

    fn loopback(camera: ScriptedSensor) -> Peripherals {
        let (attachment, link_events) =
            LoopbackAttachment::new(IpAddr::V4(Ipv4Addr::LOCALHOST), Duration::from_millis(5));
        Peripherals {
            camera: Box::new(camera),
            attachment: Arc::new(attachment),
            link_events,
        }
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut conn = TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: aperture\r\nConnection: close\r\n\r\n");
        conn.write_all(request.as_bytes()).await.expect("write request");
        let mut response = Vec::new();
        conn.read_to_end(&mut response).await.expect("read response");
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn boots_serves_and_shuts_down() {
        let cancel = CancellationToken::new();
        let appliance = Appliance::new(config(), cancel.clone());
        let running = appliance
            .start(loopback(ScriptedSensor::new(64)))
            .await
            .expect("boot");
        assert_eq!(running.link_address(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let status = http_get(running.local_addr(), "/status").await;
        assert!(status.starts_with("HTTP/1.1 200"), "{status}");
        assert!(status.contains("\"sensor_model\":\"scripted\""));
        assert!(status.contains("\"link_state\":\"connected\""));

        let index = http_get(running.local_addr(), "/").await;
        assert!(index.contains("<img src=\"/stream\""));

        let run = tokio::spawn(running.run());
        cancel.cancel();
        timeout(Duration::from_secs(2), run)
            .await
            .expect("stopped in time")
            .expect("join")
            .expect("clean shutdown");
    }

    #[tokio::test]
    async fn camera_is_untouched_when_link_never_comes_up() {
        let mut config = config();
        config.link.max_wait_attempts = 3;
        let camera = ScriptedSensor::new(64);
        let configured = camera.configure_calls();
        let (attachment, _events, link_events) = ScriptedAttachment::new();

        let outcome = Appliance::new(config, CancellationToken::new())
            .start(Peripherals {
                camera: Box::new(camera),
                attachment: Arc::new(attachment),
                link_events,
            })
            .await;

        assert!(matches!(outcome, Err(ApertureError::Link(_))));
        assert_eq!(configured.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn camera_failure_is_fatal() {
        let camera = ScriptedSensor::new(64).refuse_configuration("no sensor on the bus");
        let outcome = Appliance::new(config(), CancellationToken::new())
            .start(loopback(camera))
            .await;
        assert!(matches!(outcome, Err(ApertureError::Capture(_))));
    }

    #[tokio::test]
    async fn listener_failure_stops_camera_and_link() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.expect("occupy a port");
        let mut config = config();
        config.http.port = occupied.local_addr().unwrap().port();

        let camera = ScriptedSensor::new(64);
        let captures = camera.capture_calls();
        let (attachment, events, link_events) = ScriptedAttachment::new();
        events.send(LinkEvent::Started).await.unwrap();
        events
            .send(LinkEvent::Connected(IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .await
            .unwrap();

        let outcome = Appliance::new(config, CancellationToken::new())
            .start(Peripherals {
                camera: Box::new(camera),
                attachment: Arc::new(attachment),
                link_events,
            })
            .await;
        assert!(matches!(outcome, Err(ApertureError::Http(_))));
        assert!(events.is_closed(), "link event loop stopped");

        let settled = captures.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(captures.load(Ordering::SeqCst), settled, "capture driver stopped");
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected_before_anything_starts() {
        let mut config = config();
        config.stream.max_sessions = 0;
        let outcome = Appliance::new(config, CancellationToken::new())
            .start(loopback(ScriptedSensor::new(64)))
            .await;
        assert!(matches!(outcome, Err(ApertureError::Configuration(_))));
    }
}
