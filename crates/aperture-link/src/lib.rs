//! Network attachment tracking and automatic re-attachment.

mod attachment;
mod machine;
mod monitor;

use std::net::IpAddr;

use aperture_types::{config::Credentials, ApertureError, Result};
use async_trait::async_trait;

pub use attachment::{LoopbackAttachment, ScriptedAttachment};
pub use machine::{LinkAction, LinkStateMachine, REFUSED_ATTEMPT_RETRY};
pub use monitor::{ConnectivityMonitor, LinkHandle};

/// Asynchronous notifications from the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The interface came up and is ready to attach.
    Started,
    Connected(IpAddr),
    Disconnected,
}

/// The network stack as seen by the monitor.
///
/// Both calls only initiate work; outcomes arrive later as [`LinkEvent`]s on
/// the channel handed to [`ConnectivityMonitor::start`]. Implementations must
/// return promptly because they run on the event-handling task.
#[async_trait]
pub trait NetworkAttachment: Send + Sync + 'static {
    async fn begin(&self, credentials: &Credentials) -> Result<()>;
    async fn connect(&self) -> Result<()>;
}

pub fn link_error(message: impl Into<String>) -> ApertureError {
    ApertureError::Link(message.into())
}
