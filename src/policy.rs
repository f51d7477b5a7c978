//! Policy which is applicable to a connection pool.

use crate::recovery::Recovery;
use crate::service;

use thiserror::Error;
use tokio::time::Duration;

pub use crate::codel::CodelParameters;
pub use crate::rebalancer::FilterClock;

#[derive(Error, Debug)]
pub enum Error {
    #[error("spares must be at least 1")]
    NoSpares,

    #[error("maximum connections ({maximum}) must be at least spares ({spares})")]
    MaximumBelowSpares { maximum: usize, spares: usize },

    #[error("target ({target}) must not exceed maximum connections ({maximum})")]
    TargetAboveMaximum { target: usize, maximum: usize },
}

/// Which overload controller the pool runs on its claim queue.
#[derive(Clone, Debug)]
pub enum OverloadPolicy {
    /// Never shed claims.
    Disabled,

    /// Shed when the minimum queue delay over an interval missed the target.
    ModifiedCodel(CodelParameters),

    /// The original Controlled Delay drop schedule.
    OriginalCodel(CodelParameters),
}

/// Policy which is applicable to a connection pool.
#[derive(Clone, Debug)]
pub struct Policy {
    /// The logical service name, used only for diagnostics.
    pub domain: Option<service::Name>,

    /// Idle connections to keep available beyond observed demand.
    pub spares: usize,

    /// The maximum number of connections which can be opened by this pool.
    pub maximum: usize,

    /// Baseline number of slots to hold open; defaults to `spares`.
    pub target: Option<usize>,

    /// How long a claim may queue before failing. `None` waits forever.
    pub claim_timeout: Option<Duration>,

    /// Retry budgets and backoff schedules per action.
    pub recovery: Recovery,

    /// Overload shedding on the claim queue.
    pub overload: OverloadPolicy,

    /// When set, the ready set's ordering is reshuffled on this period so
    /// long-lived pools spread claims across their connections.
    pub decoherence_interval: Option<Duration>,

    /// How often idle connections are revalidated and overlong idlers
    /// reclaimed.
    pub check_interval: Duration,

    /// Time budget for a single validity check.
    pub check_timeout: Duration,

    /// Cap on any retry delay whose policy does not set its own maximum.
    pub max_chained_backoff: Duration,

    /// How the demand envelope used to dampen shrinking decays.
    pub filter: FilterClock,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            domain: None,
            spares: 8,
            maximum: 16,
            target: None,
            claim_timeout: None,
            recovery: Recovery::default(),
            overload: OverloadPolicy::Disabled,
            decoherence_interval: None,
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(2),
            max_chained_backoff: Duration::from_secs(10),
            filter: FilterClock::WallTime {
                time_constant: Duration::from_secs(5),
            },
        }
    }
}

impl Policy {
    /// The baseline slot count the rebalancer aims for.
    pub fn target(&self) -> usize {
        self.target.unwrap_or(self.spares)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.spares == 0 {
            return Err(Error::NoSpares);
        }
        if self.maximum < self.spares {
            return Err(Error::MaximumBelowSpares {
                maximum: self.maximum,
                spares: self.spares,
            });
        }
        if self.target() > self.maximum {
            return Err(Error::TargetAboveMaximum {
                target: self.target(),
                maximum: self.maximum,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        assert!(Policy::default().validate().is_ok());
    }

    #[test]
    fn maximum_below_spares_is_rejected() {
        let policy = Policy {
            spares: 8,
            maximum: 4,
            ..Default::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(Error::MaximumBelowSpares { maximum: 4, spares: 8 })
        ));
    }

    #[test]
    fn target_defaults_to_spares() {
        let policy = Policy {
            spares: 3,
            ..Default::default()
        };
        assert_eq!(policy.target(), 3);

        let policy = Policy {
            spares: 3,
            target: Some(5),
            ..Default::default()
        };
        assert_eq!(policy.target(), 5);
    }
}
