use std::{net::IpAddr, sync::Arc};

use aperture_types::{
    config::LinkConfig,
    link::{LinkState, LinkStatus},
    Result,
};
use futures::{stream::BoxStream, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, sleep_until, Duration, Instant},
};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{link_error, LinkAction, LinkEvent, LinkStateMachine, NetworkAttachment};

/// Read-only view of the link state. Cheap to clone.
#[derive(Clone)]
pub struct LinkHandle {
    rx: watch::Receiver<LinkStatus>,
}

impl LinkHandle {
    pub fn status(&self) -> LinkStatus {
        *self.rx.borrow()
    }

    pub fn state(&self) -> LinkState {
        self.rx.borrow().state
    }

    pub fn changes(&self) -> BoxStream<'static, LinkStatus> {
        WatchStream::new(self.rx.clone()).boxed()
    }

    /// Poll until the link is up, giving up after `max_attempts` polls.
    pub async fn wait_for_connection(
        &self,
        poll_interval: Duration,
        max_attempts: u32,
    ) -> Result<IpAddr> {
        for _ in 0..max_attempts {
            if let Some(address) = self.connected_address() {
                return Ok(address);
            }
            info!("Waiting for network link...");
            sleep(poll_interval).await;
        }
        self.connected_address()
            .ok_or_else(|| link_error("network connection failed"))
    }

    fn connected_address(&self) -> Option<IpAddr> {
        let status = self.status();
        if status.is_connected() {
            status.address
        } else {
            None
        }
    }
}

/// Owns the event-handling task that drives the link state machine.
pub struct ConnectivityMonitor {
    handle: LinkHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Spawn the event handler and bring the interface up.
    pub async fn start(
        attachment: Arc<dyn NetworkAttachment>,
        events: mpsc::Receiver<LinkEvent>,
        config: &LinkConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (status_tx, status_rx) = watch::channel(LinkStatus::initial());
        let cancel = cancel.child_token();
        let task = tokio::spawn(event_loop(
            attachment.clone(),
            events,
            LinkStateMachine::new(config.backoff),
            status_tx,
            cancel.clone(),
        ));

        if let Err(err) = attachment.begin(&config.credentials).await {
            cancel.cancel();
            return Err(err);
        }
        info!(
            "Network started, connecting to SSID: {}",
            config.credentials.ssid
        );

        Ok(Self {
            handle: LinkHandle { rx: status_rx },
            cancel,
            task,
        })
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!("Link event handler ended abnormally: {err}");
        }
    }
}

async fn event_loop(
    attachment: Arc<dyn NetworkAttachment>,
    mut events: mpsc::Receiver<LinkEvent>,
    mut machine: LinkStateMachine,
    status_tx: watch::Sender<LinkStatus>,
    cancel: CancellationToken,
) {
    let mut retry_at: Option<Instant> = None;

    loop {
        let action = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                retry_at = None;
                Some(LinkAction::Attempt { delay: Duration::ZERO })
            }
            event = events.recv() => match event {
                Some(event) => {
                    log_event(&event);
                    let action = machine.on_event(event);
                    if action.is_some() {
                        retry_at = None;
                    }
                    action
                }
                None => {
                    warn!("Network event channel closed; link monitor stopping");
                    break;
                }
            },
        };

        if let Some(LinkAction::Attempt { delay }) = action {
            if delay.is_zero() {
                if let Some(LinkAction::Attempt { delay }) =
                    initiate_attempt(attachment.as_ref(), &mut machine).await
                {
                    retry_at = Some(Instant::now() + delay);
                }
            } else {
                info!("Reconnecting in {:?}", delay);
                retry_at = Some(Instant::now() + delay);
            }
        }

        status_tx.send_replace(machine.status());
    }
}

async fn initiate_attempt(
    attachment: &dyn NetworkAttachment,
    machine: &mut LinkStateMachine,
) -> Option<LinkAction> {
    machine.attempt_started();
    match attachment.connect().await {
        Ok(()) => None,
        Err(err) => {
            error!("Could not start network attempt: {err}");
            Some(machine.attempt_refused())
        }
    }
}

fn log_event(event: &LinkEvent) {
    match event {
        LinkEvent::Started => info!("Network interface started"),
        LinkEvent::Connected(address) => info!("Got IP address: {}", address),
        LinkEvent::Disconnected => warn!("Disconnected from network, retrying..."),
    }
}
