use std::time::Duration;

use aperture_types::{
    config::BackoffConfig,
    link::{LinkState, LinkStatus},
};

use crate::LinkEvent;

/// Lower bound on the retry delay after the attachment refused to start an attempt.
pub const REFUSED_ATTEMPT_RETRY: Duration = Duration::from_secs(1);

/// Side effect requested by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// Start an attachment attempt after `delay`.
    Attempt { delay: Duration },
}

/// Pure transition logic; the event loop owns one and performs its actions.
#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    status: LinkStatus,
    backoff: BackoffConfig,
    consecutive_failures: u32,
}

impl LinkStateMachine {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            status: LinkStatus::initial(),
            backoff,
            consecutive_failures: 0,
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn on_event(&mut self, event: LinkEvent) -> Option<LinkAction> {
        match event {
            LinkEvent::Started => match self.status.state {
                LinkState::Disconnected => Some(LinkAction::Attempt {
                    delay: Duration::ZERO,
                }),
                LinkState::Connecting | LinkState::Connected => None,
            },
            LinkEvent::Connected(address) => {
                self.status.state = LinkState::Connected;
                self.status.address = Some(address);
                self.consecutive_failures = 0;
                None
            }
            LinkEvent::Disconnected => {
                self.status.state = LinkState::Disconnected;
                self.status.address = None;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                Some(LinkAction::Attempt {
                    delay: self.backoff_delay(),
                })
            }
        }
    }

    /// Record that an attempt is actually being initiated.
    pub fn attempt_started(&mut self) {
        self.status.state = LinkState::Connecting;
        self.status.attempts += 1;
    }

    /// The attachment could not even start the attempt.
    pub fn attempt_refused(&mut self) -> LinkAction {
        self.status.state = LinkState::Disconnected;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        LinkAction::Attempt {
            delay: self.backoff_delay().max(REFUSED_ATTEMPT_RETRY),
        }
    }

    fn backoff_delay(&self) -> Duration {
        if self.backoff.base_ms == 0 || self.consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (self.consecutive_failures - 1).min(16);
        let delay_ms = self
            .backoff
            .base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff.max_ms.max(self.backoff.base_ms));
        Duration::from_millis(delay_ms)
    }
}
