//! Retry budgets and backoff schedules for connection attempts.
//!
//! A [Recovery] descriptor maps named actions (`"connect"`, `"initial"`, ...)
//! to a [RetryPolicy]. Components look their action up and fall back to the
//! mandatory default entry when the action has no entry of its own.

use crate::backoff::ExponentialBackoff;

use std::collections::BTreeMap;
use tokio::time::Duration;

/// The action the socket manager uses for ordinary connection attempts.
pub const CONNECT_ACTION: &str = "connect";

/// The action the pool uses for its first wave of connection attempts.
pub const INITIAL_ACTION: &str = "initial";

/// How many attempts an action is allowed before it is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retries {
    Finite(u32),
    Infinite,
}

impl Retries {
    /// True once `attempt` attempts have failed and no budget remains.
    ///
    /// `Finite(0)` is exhausted before any attempt is made.
    pub fn exhausted_after(&self, attempt: u32) -> bool {
        match self {
            Retries::Finite(n) => attempt >= *n,
            Retries::Infinite => false,
        }
    }
}

/// Retry and backoff parameters for a single action.
///
/// Attempt `n` (1-based) runs with a timeout of `timeout * 2^(n-1)` and, on
/// failure, a delay of `delay * 2^(n-1)` before attempt `n + 1`; both are
/// capped by their respective maxima when present.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub retries: Retries,
    pub timeout: Duration,
    pub delay: Duration,
    pub max_timeout: Option<Duration>,
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: Retries::Finite(5),
            timeout: Duration::from_secs(2),
            delay: Duration::from_millis(250),
            max_timeout: Some(Duration::from_secs(30)),
            max_delay: Some(Duration::from_secs(10)),
        }
    }
}

impl RetryPolicy {
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        scaled(self.timeout, self.max_timeout, attempt)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        scaled(self.delay, self.max_delay, attempt)
    }

    /// The policy a monitor slot runs with once this policy is exhausted:
    /// infinite retries at the final attempt's timeout and delay, with no
    /// further growth.
    pub fn monitor_policy(&self) -> RetryPolicy {
        let last = match self.retries {
            Retries::Finite(n) if n > 0 => n,
            _ => 1,
        };
        let timeout = self.timeout_for(last);
        let delay = self.delay_for(last);
        RetryPolicy {
            retries: Retries::Infinite,
            timeout,
            delay,
            max_timeout: Some(timeout),
            max_delay: Some(delay),
        }
    }
}

// min(cap, base * 2^(attempt - 1)), saturating.
fn scaled(base: Duration, cap: Option<Duration>, attempt: u32) -> Duration {
    debug_assert!(attempt >= 1, "attempts are numbered from 1");
    let cap = cap.unwrap_or(Duration::MAX);
    let mut value = std::cmp::min(base, cap);
    for _ in 1..attempt {
        let next = value.exponential_backoff(cap);
        if next == value {
            break;
        }
        value = next;
    }
    value
}

/// A mapping from action names to retry policies.
#[derive(Clone, Debug, Default)]
pub struct Recovery {
    default: RetryPolicy,
    actions: BTreeMap<String, RetryPolicy>,
}

impl Recovery {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            actions: BTreeMap::new(),
        }
    }

    pub fn with_action(mut self, action: impl ToString, policy: RetryPolicy) -> Self {
        self.actions.insert(action.to_string(), policy);
        self
    }

    /// The policy for `action`, or the default entry when absent.
    pub fn policy(&self, action: &str) -> &RetryPolicy {
        self.actions.get(action).unwrap_or(&self.default)
    }
}
