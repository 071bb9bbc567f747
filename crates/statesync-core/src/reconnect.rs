use crate::types::ConnectionState;
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Decides whether and when a dropped channel is retried.
///
/// `attempt` is 0-indexed and counts retries since the last successful
/// connection.
pub trait ReconnectPolicy: Send + Sync {
    fn should_retry(&self, attempt: u32) -> bool;

    fn delay_for(&self, attempt: u32) -> Duration;
}

/// `delay = min(base * 2^attempt, max)`, bounded by `max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

/// What the transport should do after its connection dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropDecision {
    /// Wait `delay`, then reconnect. `attempt` is 1-based for logging.
    Retry { attempt: u32, delay: Duration },
    /// Budget exhausted; the channel stays FAILED until an external trigger.
    GiveUp { attempts: u32 },
    /// The caller closed the channel; nothing more happens.
    Stopped,
}

/// Runtime-free connection state machine.
///
/// Every method that can move the state returns `Some(new_state)` when the
/// state actually changed, so the transport publishes each transition once.
#[derive(Debug)]
pub struct ConnectionTracker<P = ExponentialBackoff> {
    policy: P,
    state: ConnectionState,
    attempts: u32,
    closed: bool,
}

impl<P: ReconnectPolicy> ConnectionTracker<P> {
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// A connection attempt is starting.
    pub fn begin_connect(&mut self) -> Option<ConnectionState> {
        if self.closed {
            return None;
        }
        let next = match self.state {
            ConnectionState::Reconnecting => ConnectionState::Reconnecting,
            _ => ConnectionState::Connecting,
        };
        self.transition(next)
    }

    /// The underlying connection opened.
    pub fn on_open(&mut self) -> Option<ConnectionState> {
        if self.closed {
            return None;
        }
        self.attempts = 0;
        self.transition(ConnectionState::Connected)
    }

    /// The connection closed or errored, or an attempt to open it failed.
    pub fn on_drop(&mut self) -> (DropDecision, Option<ConnectionState>) {
        if self.closed {
            return (DropDecision::Stopped, None);
        }

        if self.policy.should_retry(self.attempts) {
            let delay = self.policy.delay_for(self.attempts);
            self.attempts += 1;
            let decision = DropDecision::Retry {
                attempt: self.attempts,
                delay,
            };
            warn!(
                "Connection dropped, retry {} in {:?}",
                self.attempts, delay
            );
            (decision, self.transition(ConnectionState::Reconnecting))
        } else {
            error!(
                "Reconnect budget exhausted after {} attempts",
                self.attempts
            );
            let decision = DropDecision::GiveUp {
                attempts: self.attempts,
            };
            (decision, self.transition(ConnectionState::Failed))
        }
    }

    /// The caller closed the channel. Terminal.
    pub fn on_close_requested(&mut self) -> Option<ConnectionState> {
        if self.closed {
            return None;
        }
        self.closed = true;
        self.transition(ConnectionState::Disconnected)
    }

    /// External trigger (e.g. user-initiated reconnect): clears the attempt
    /// counter so a FAILED channel can try again.
    pub fn reset_for_manual_reconnect(&mut self) -> Option<ConnectionState> {
        if self.closed {
            return None;
        }
        self.attempts = 0;
        self.transition(ConnectionState::Connecting)
    }

    fn transition(&mut self, next: ConnectionState) -> Option<ConnectionState> {
        if self.state == next {
            return None;
        }
        info!("Connection state {} -> {}", self.state, next);
        self.state = next;
        Some(next)
    }
}

impl Default for ConnectionTracker<ExponentialBackoff> {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}
