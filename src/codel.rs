//! Overload controllers for the claim queue, built on Controlled Delay.
//!
//! Refer to https://queue.acm.org/appendices/codel.html for
//! additional context.
//!
//! Two controller variants are provided. [ControlledDelay] is the original
//! Nichols/Jacobson algorithm: once sojourn times have stayed above the
//! target for a full interval it enters a dropping state, shedding claims on
//! an accelerating `interval / sqrt(count)` schedule. [ModifiedDelay] tracks
//! the minimum sojourn per interval and declares the whole pool overloaded
//! when even the fastest claim missed the target; it then sheds only claims
//! that have already waited twice the target.
//!
//! Both variants also derive an idle-connection lifetime ceiling from how
//! recently the queue was last empty, which the pool uses to reclaim unused
//! connections under sustained pressure.

use tokio::time::{Duration, Instant};

/// Parameters shared by both Controlled Delay variants.
#[derive(Clone, Debug)]
pub struct CodelParameters {
    /// The acceptable duration of travel through the claim queue.
    pub target: Duration,

    /// The window over which sojourn times must beat the target.
    pub interval: Duration,

    /// How long the queue may go without emptying before the pool is
    /// considered busy enough to shorten idle-connection lifetimes.
    pub last_empty_bound: Duration,
}

impl Default for CodelParameters {
    fn default() -> Self {
        Self {
            target: Duration::from_millis(500),
            interval: Duration::from_millis(100),
            last_empty_bound: Duration::from_millis(10_000),
        }
    }
}

// Idle ceiling shared by both variants: a queue that has not emptied within
// the bound is under sustained pressure, so unused connections get a short
// leash; otherwise they may idle for the full bound.
fn max_idle(params: &CodelParameters, last_empty: Instant, now: Instant) -> Duration {
    if now.saturating_duration_since(last_empty) > params.last_empty_bound {
        params.target * 3
    } else {
        params.last_empty_bound
    }
}

/// The original Controlled Delay algorithm.
#[derive(Debug)]
pub(crate) struct ControlledDelay {
    params: CodelParameters,

    // When set, the deadline by which some claim must beat the target.
    must_hit_target_by: Option<Instant>,

    last_empty: Instant,

    // The time to shed the next claim while dropping.
    drop_next: Option<Instant>,
    // Claims shed since entering the dropping state.
    drop_count: usize,
    dropping: bool,
}

impl ControlledDelay {
    pub(crate) fn new(params: CodelParameters) -> Self {
        Self {
            params,
            must_hit_target_by: None,
            last_empty: Instant::now(),
            drop_next: None,
            drop_count: 0,
            dropping: false,
        }
    }

    fn can_drop(&mut self, now: Instant, start: Instant) -> bool {
        let sojourn = now.saturating_duration_since(start);

        // A single fast claim clears the deadline entirely.
        if sojourn < self.params.target {
            self.must_hit_target_by = None;
            return false;
        }

        match self.must_hit_target_by {
            Some(must_hit_target_by) => must_hit_target_by <= now,
            None => {
                self.must_hit_target_by = Some(now + self.params.interval);
                false
            }
        }
    }

    /// Given the enqueue time of a claim being paired, returns whether the
    /// claim should be shed instead.
    pub(crate) fn should_drop(&mut self, start: Instant) -> bool {
        self.should_drop_inner(Instant::now(), start)
    }

    // This is a pattern used throughout this module:
    //
    // Any functions depending on "now" take it as an input parameter,
    // so we can more easily create deterministic tests.
    fn should_drop_inner(&mut self, now: Instant, start: Instant) -> bool {
        let ok_to_drop = self.can_drop(now, start);

        if self.dropping {
            if !ok_to_drop {
                self.dropping = false;
                return false;
            }

            if let Some(drop_next) = self.drop_next {
                if now >= drop_next {
                    self.drop_count += 1;
                    self.set_drop_next(now);
                    return true;
                }
            }
            return false;
        }

        if ok_to_drop {
            let dropped_recently = self
                .drop_next
                .map(|drop_next| now.saturating_duration_since(drop_next) < self.params.interval)
                .unwrap_or(false);

            self.dropping = true;
            self.drop_count = if dropped_recently && self.drop_count > 2 {
                self.drop_count - 2
            } else {
                1
            };
            self.set_drop_next(now);
            return true;
        }

        false
    }

    fn set_drop_next(&mut self, now: Instant) {
        if self.drop_count > 0 {
            self.drop_next = Some(
                now + self
                    .params
                    .interval
                    .div_f64((self.drop_count as f64).sqrt()),
            );
        }
    }

    pub(crate) fn queue_cleared(&mut self) {
        self.queue_cleared_inner(Instant::now());
    }

    fn queue_cleared_inner(&mut self, now: Instant) {
        self.last_empty = now;
        self.drop_next = None;
        self.dropping = false;
        self.drop_count = 0;
        self.must_hit_target_by = None;
    }

    pub(crate) fn get_max_idle(&self) -> Duration {
        self.get_max_idle_inner(Instant::now())
    }

    fn get_max_idle_inner(&self, now: Instant) -> Duration {
        max_idle(&self.params, self.last_empty, now)
    }
}

/// The modified Controlled Delay variant.
///
/// Instead of a drop schedule, this variant watches the *minimum* sojourn
/// time over each interval. If even the best-served claim in a full interval
/// missed the target, the pool as a whole is overloaded, and any claim that
/// has already waited more than twice the target is shed.
#[derive(Debug)]
pub(crate) struct ModifiedDelay {
    params: CodelParameters,

    interval_end: Option<Instant>,
    min_delay: Duration,
    overloaded: bool,

    last_empty: Instant,
}

impl ModifiedDelay {
    pub(crate) fn new(params: CodelParameters) -> Self {
        Self {
            params,
            interval_end: None,
            min_delay: Duration::ZERO,
            overloaded: false,
            last_empty: Instant::now(),
        }
    }

    pub(crate) fn should_drop(&mut self, start: Instant) -> bool {
        self.should_drop_inner(Instant::now(), start)
    }

    fn should_drop_inner(&mut self, now: Instant, start: Instant) -> bool {
        let sojourn = now.saturating_duration_since(start);

        match self.interval_end {
            Some(end) if now < end => {
                self.min_delay = std::cmp::min(self.min_delay, sojourn);
            }
            // First measurement at or past the interval end: judge the
            // finished interval, then open a new one seeded with this sample.
            Some(_) => {
                self.overloaded = self.min_delay > self.params.target;
                self.interval_end = Some(now + self.params.interval);
                self.min_delay = sojourn;
            }
            None => {
                self.interval_end = Some(now + self.params.interval);
                self.min_delay = sojourn;
            }
        }

        self.overloaded && sojourn > self.params.target * 2
    }

    pub(crate) fn queue_cleared(&mut self) {
        self.queue_cleared_inner(Instant::now());
    }

    fn queue_cleared_inner(&mut self, now: Instant) {
        // An emptied queue invalidates the running interval: whatever verdict
        // it was building described a backlog that no longer exists.
        self.last_empty = now;
        self.interval_end = None;
        self.min_delay = Duration::ZERO;
        self.overloaded = false;
    }

    pub(crate) fn get_max_idle(&self) -> Duration {
        self.get_max_idle_inner(Instant::now())
    }

    fn get_max_idle_inner(&self, now: Instant) -> Duration {
        max_idle(&self.params, self.last_empty, now)
    }
}

/// The overload controller attached to a pool.
#[derive(Debug)]
pub(crate) enum Controller {
    Disabled,
    Modified(ModifiedDelay),
    Original(ControlledDelay),
}

impl Controller {
    /// Whether the claim enqueued at `start` should be shed rather than
    /// paired. Sampled once per pairing attempt.
    pub(crate) fn should_drop(&mut self, start: Instant) -> bool {
        match self {
            Controller::Disabled => false,
            Controller::Modified(c) => c.should_drop(start),
            Controller::Original(c) => c.should_drop(start),
        }
    }

    /// Called when the ready set goes empty-or-all-claimed.
    pub(crate) fn queue_cleared(&mut self) {
        match self {
            Controller::Disabled => {}
            Controller::Modified(c) => c.queue_cleared(),
            Controller::Original(c) => c.queue_cleared(),
        }
    }

    /// Lifetime ceiling for unused idle connections.
    pub(crate) fn get_max_idle(&self) -> Duration {
        match self {
            Controller::Disabled => Duration::MAX,
            Controller::Modified(c) => c.get_max_idle(),
            Controller::Original(c) => c.get_max_idle(),
        }
    }
}
