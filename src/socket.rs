//! The socket manager: lifecycle of connection attempts toward one backend.
//!
//! One socket manager belongs to exactly one slot. It sequences connection
//! attempts against the slot's retry policy: how long each attempt may take,
//! how long to back off before the next one, and when the budget is
//! exhausted. It is a pure state machine — the owning slot supplies the
//! clock, runs the actual connect future, and reports the outcome — which
//! keeps every transition deterministic under test.
//!
//! The manager deliberately knows nothing about backend health as the pool
//! sees it; it only counts its own attempts.

use crate::recovery::RetryPolicy;

use tokio::time::{Duration, Instant};

/// How a connection attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Failure {
    /// The attempt outlived its timeout.
    Timeout,
    /// The connector reported an error.
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SocketState {
    /// Not connected, not trying. The initial and terminal state.
    Stopped,
    /// Backing off until the next attempt.
    Delay { until: Instant },
    /// An attempt is in flight with the given timeout.
    Connecting { timeout: Duration },
    /// The connection is established.
    Connected,
    /// The last attempt failed. `exhausted` means no retry budget remains
    /// and the manager is awaiting direction from the slot.
    Error { exhausted: bool },
    /// The established connection has gone away.
    Closed,
}

#[derive(Debug)]
pub(crate) struct SocketMgr {
    policy: RetryPolicy,
    state: SocketState,

    /// Attempts begun so far under the current budget.
    attempt: u32,
    ever_attempted: bool,

    last_timeout: Duration,
    last_delay: Duration,
    last_failure: Option<Failure>,
}

impl SocketMgr {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: SocketState::Stopped,
            attempt: 0,
            ever_attempted: false,
            last_timeout: Duration::ZERO,
            last_delay: Duration::ZERO,
            last_failure: None,
        }
    }

    pub(crate) fn state(&self) -> SocketState {
        self.state
    }

    pub(crate) fn current_attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn last_timeout(&self) -> Duration {
        self.last_timeout
    }

    pub(crate) fn last_delay(&self) -> Duration {
        self.last_delay
    }

    /// Whether the most recent failure was a timeout rather than an explicit
    /// error. Backends that time out are usually overloaded rather than dead.
    pub(crate) fn overloaded(&self) -> bool {
        self.last_failure == Some(Failure::Timeout)
    }

    /// External connect signal: start a fresh attempt budget.
    ///
    /// The very first connect is immediate; reconnecting an already-used
    /// manager backs off for the base delay first. A zero-retry budget is
    /// exhausted on the spot, before any attempt.
    pub(crate) fn connect(&mut self, now: Instant) {
        debug_assert!(matches!(
            self.state,
            SocketState::Stopped | SocketState::Error { .. } | SocketState::Closed
        ));
        self.attempt = 0;
        if self.policy.retries.exhausted_after(0) {
            self.state = SocketState::Error { exhausted: true };
            return;
        }
        let delay = if self.ever_attempted {
            self.policy.delay_for(1)
        } else {
            Duration::ZERO
        };
        self.last_delay = delay;
        self.state = SocketState::Delay { until: now + delay };
    }

    /// Retry signal from the slot: consume one retry and back off.
    ///
    /// Returns false, leaving the manager in its exhausted error state, when
    /// the budget does not cover another attempt.
    pub(crate) fn retry(&mut self, now: Instant) -> bool {
        debug_assert!(matches!(
            self.state,
            SocketState::Error { .. } | SocketState::Closed
        ));
        if self.policy.retries.exhausted_after(self.attempt) {
            self.state = SocketState::Error { exhausted: true };
            return false;
        }
        let delay = self.policy.delay_for(self.attempt.max(1));
        self.last_delay = delay;
        self.state = SocketState::Delay { until: now + delay };
        true
    }

    /// The delay elapsed; begin the next attempt. Returns the timeout the
    /// attempt must finish within.
    pub(crate) fn begin_attempt(&mut self) -> Duration {
        debug_assert!(matches!(self.state, SocketState::Delay { .. }));
        self.attempt = self.attempt.saturating_add(1);
        self.ever_attempted = true;
        let timeout = self.policy.timeout_for(self.attempt);
        self.last_timeout = timeout;
        self.state = SocketState::Connecting { timeout };
        timeout
    }

    pub(crate) fn on_connected(&mut self) {
        debug_assert!(matches!(self.state, SocketState::Connecting { .. }));
        self.last_failure = None;
        self.state = SocketState::Connected;
    }

    pub(crate) fn on_error(&mut self, failure: Failure) {
        debug_assert!(matches!(self.state, SocketState::Connecting { .. }));
        self.last_failure = Some(failure);
        self.state = SocketState::Error {
            exhausted: self.policy.retries.exhausted_after(self.attempt),
        };
    }

    /// The established connection closed or stopped answering.
    pub(crate) fn on_closed(&mut self) {
        debug_assert!(matches!(self.state, SocketState::Connected));
        self.state = SocketState::Closed;
    }

    /// Teardown from the slot; the connection object is gone.
    pub(crate) fn destroy(&mut self) {
        self.state = SocketState::Stopped;
    }
}
