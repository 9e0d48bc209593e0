use std::time::Duration;

use crate::protocol::SubscribeStatus;

pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const RECONNECT_BASE_DELAY_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            base_delay: Duration::from_millis(RECONNECT_BASE_DELAY_MS),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the zero-based reconnect attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Start,
    Status(SubscribeStatus),
    /// Every channel of the current subscription set reported `SUBSCRIBED`.
    AllSubscribed,
    BackoffElapsed,
    Online,
    Offline,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Subscribe,
    ScheduleReconnect { attempt: u32, delay: Duration },
    Resubscribe,
    CancelReconnect,
    Disable,
    Teardown,
    None,
}

/// Connection lifecycle for the realtime channel set.
///
/// Only one reconnect can be pending at a time: failure statuses that arrive
/// while in `Backoff` are ignored, and `Disabled` is terminal. The attempt
/// budget is only restored by `AllSubscribed`, so a set where one channel
/// keeps failing still runs out.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    policy: ReconnectPolicy,
    state: LinkState,
    attempts: u32,
}

impl ReconnectMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: LinkState::Disconnected,
            attempts: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn handle(&mut self, event: LinkEvent) -> LinkAction {
        use LinkState::*;

        match (self.state, event) {
            (Disabled, _) => LinkAction::None,
            (_, LinkEvent::Stop) => {
                self.state = Disconnected;
                LinkAction::Teardown
            }
            (Disconnected, LinkEvent::Start) => {
                self.state = Connecting;
                LinkAction::Subscribe
            }
            (_, LinkEvent::Start) => LinkAction::None,
            (Connecting | Connected, LinkEvent::Status(SubscribeStatus::Subscribed)) => {
                self.state = Connected;
                LinkAction::None
            }
            (Connecting | Connected, LinkEvent::AllSubscribed) => {
                self.state = Connected;
                self.attempts = 0;
                LinkAction::None
            }
            (_, LinkEvent::AllSubscribed) => LinkAction::None,
            (Connecting | Connected, LinkEvent::Status(_)) => self.schedule(),
            (_, LinkEvent::Status(_)) => LinkAction::None,
            (Backoff, LinkEvent::BackoffElapsed) => {
                self.state = Connecting;
                LinkAction::Resubscribe
            }
            (_, LinkEvent::BackoffElapsed) => LinkAction::None,
            (Backoff, LinkEvent::Online) => LinkAction::None,
            (_, LinkEvent::Online) => {
                if self.attempts >= self.policy.max_attempts {
                    self.state = Disabled;
                    return LinkAction::Disable;
                }
                self.attempts += 1;
                self.state = Connecting;
                LinkAction::Resubscribe
            }
            (_, LinkEvent::Offline) => {
                self.state = Disconnected;
                LinkAction::CancelReconnect
            }
        }
    }

    fn schedule(&mut self) -> LinkAction {
        if self.attempts >= self.policy.max_attempts {
            self.state = LinkState::Disabled;
            return LinkAction::Disable;
        }
        let attempt = self.attempts;
        self.attempts += 1;
        self.state = LinkState::Backoff;
        LinkAction::ScheduleReconnect {
            attempt,
            delay: self.policy.delay_for(attempt),
        }
    }
}
