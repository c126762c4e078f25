use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use aperture_types::{config::Credentials, Result};
use async_trait::async_trait;
use tokio::{
    sync::mpsc,
    time::{sleep, Duration},
};
use tracing::{debug, info};

use crate::{link_error, LinkEvent, NetworkAttachment};

const EVENT_QUEUE_DEPTH: usize = 16;

/// Attachment for running on a host that is already on the network.
///
/// `begin` reports the interface as started and every attempt succeeds after
/// `connect_delay` with the configured address.
pub struct LoopbackAttachment {
    events: mpsc::Sender<LinkEvent>,
    address: IpAddr,
    connect_delay: Duration,
}

impl LoopbackAttachment {
    pub fn new(address: IpAddr, connect_delay: Duration) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (events, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        (
            Self {
                events,
                address,
                connect_delay,
            },
            rx,
        )
    }
}

#[async_trait]
impl NetworkAttachment for LoopbackAttachment {
    async fn begin(&self, credentials: &Credentials) -> Result<()> {
        if credentials.ssid.is_empty() {
            return Err(link_error("no SSID configured"));
        }
        self.events
            .send(LinkEvent::Started)
            .await
            .map_err(|_| link_error("link monitor is not listening"))
    }

    async fn connect(&self) -> Result<()> {
        let events = self.events.clone();
        let address = self.address;
        let delay = self.connect_delay;
        debug!("Loopback attachment attempt, completes in {:?}", delay);
        tokio::spawn(async move {
            sleep(delay).await;
            if events.send(LinkEvent::Connected(address)).await.is_err() {
                debug!("Link monitor gone before loopback attempt completed");
            }
        });
        Ok(())
    }
}

/// Attachment that records calls and never emits events on its own.
///
/// Tests push [`LinkEvent`]s through the sender returned by [`ScriptedAttachment::new`].
#[derive(Clone, Default)]
pub struct ScriptedAttachment {
    begins: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
    refuse_connect: bool,
}

impl ScriptedAttachment {
    pub fn new() -> (Self, mpsc::Sender<LinkEvent>, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        (Self::default(), tx, rx)
    }

    pub fn refusing_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    pub fn begin_calls(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkAttachment for ScriptedAttachment {
    async fn begin(&self, credentials: &Credentials) -> Result<()> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        info!("Scripted attachment started for SSID {}", credentials.ssid);
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect {
            Err(link_error("radio refused the attempt"))
        } else {
            Ok(())
        }
    }
}
