use std::{fmt, net::IpAddr};

use serde::{Deserialize, Serialize};

/// Network attachment state owned by the connectivity monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Snapshot published on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub state: LinkState,
    pub address: Option<IpAddr>,
    /// Attachment attempts initiated since boot.
    pub attempts: u64,
}

impl LinkStatus {
    pub fn initial() -> Self {
        Self {
            state: LinkState::Disconnected,
            address: None,
            attempts: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::initial()
    }
}
