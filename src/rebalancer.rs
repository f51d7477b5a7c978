//! Deciding how many slots each backend should hold.
//!
//! The planner is a pure function from the pool's current shape to a list of
//! actions; the pool's driver applies the actions and replans when something
//! of interest changes (a backend came or went, a backend died or recovered,
//! a slot terminated, or claims started queueing with spare capacity
//! available).
//!
//! The [DemandFilter] keeps the planner's target from chasing every dip in
//! demand: the effective target is the configured one or a decaying envelope
//! of recent peak demand, whichever is larger, so oscillating load does not
//! churn slots.

use crate::backend;
use crate::slot::SlotId;

use tokio::time::{Duration, Instant};

/// Where a live slot is in its life, as the planner cares about it.
///
/// Retirement prefers slots that are cheapest to lose: ones still
/// connecting, then idle ones, then claimed ones. Slots already draining are
/// never touched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Phase {
    Starting,
    Idle,
    Claimed,
    Closing,
}

/// The planner's view of one live slot.
#[derive(Clone, Debug)]
pub(crate) struct SlotView {
    pub(crate) id: SlotId,
    pub(crate) backend: backend::Name,
    pub(crate) phase: Phase,
    pub(crate) monitor: bool,
    pub(crate) unwanted: bool,
}

/// Everything the planner looks at.
#[derive(Debug)]
pub(crate) struct PlanInput<'a> {
    /// Healthy backends, oldest first; ties broken by key by the caller.
    pub(crate) healthy: &'a [backend::Name],
    /// Backends currently marked dead.
    pub(crate) dead: &'a [backend::Name],
    /// Every live (non-stopped) slot, monitors included.
    pub(crate) slots: &'a [SlotView],
    /// Slots wanted across all healthy backends.
    pub(crate) target: usize,
    /// Hard cap on slots for any one backend.
    pub(crate) max: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Action {
    Create { backend: backend::Name },
    Retire { slot: SlotId },
    CreateMonitor { backend: backend::Name },
}

/// Maps the current distribution to the desired one.
pub(crate) fn plan(input: &PlanInput<'_>) -> Vec<Action> {
    let mut actions = Vec::new();

    // Desired distribution: an even split of the target, remainder to the
    // earliest-added backends.
    let n = input.healthy.len();
    let desired = |index: usize| -> usize {
        let base = input.target / n;
        let extra = usize::from(index < input.target % n);
        std::cmp::min(base + extra, input.max)
    };

    for (index, name) in input.healthy.iter().enumerate() {
        let desired = desired(index);

        let current: Vec<&SlotView> = input
            .slots
            .iter()
            .filter(|s| !s.monitor && s.backend == *name)
            .collect();

        if current.len() > desired {
            // Shed the surplus, cheapest slots first. Draining and
            // already-unwanted slots are left alone; if the surplus is
            // tied up in them, it resolves itself.
            let mut candidates: Vec<&SlotView> = current
                .iter()
                .copied()
                .filter(|s| s.phase != Phase::Closing && !s.unwanted)
                .collect();
            candidates.sort_by_key(|s| (s.phase, s.id));
            for slot in candidates.into_iter().take(current.len() - desired) {
                actions.push(Action::Retire { slot: slot.id });
            }
        } else {
            for _ in current.len()..desired {
                actions.push(Action::Create {
                    backend: name.clone(),
                });
            }
        }
    }

    // Every dead backend keeps exactly one monitor probing it.
    for name in input.dead {
        let has_monitor = input
            .slots
            .iter()
            .any(|s| s.monitor && s.backend == *name && s.phase != Phase::Closing);
        if !has_monitor {
            actions.push(Action::CreateMonitor {
                backend: name.clone(),
            });
        }
    }

    actions
}

/// How the demand envelope decays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterClock {
    /// Exponential decay against elapsed wall time.
    WallTime { time_constant: Duration },
    /// One decay step per observed claim, independent of wall time.
    ClaimCount { claims: u32 },
}

/// A decaying envelope of peak demand.
///
/// Demand is sampled as `claimed slots + queued claims` whenever the pool
/// takes a claim; the envelope rises instantly and decays on the configured
/// clock.
#[derive(Debug)]
pub(crate) struct DemandFilter {
    clock: FilterClock,
    level: f64,
    updated: Instant,
}

impl DemandFilter {
    pub(crate) fn new(clock: FilterClock) -> Self {
        Self {
            clock,
            level: 0.0,
            updated: Instant::now(),
        }
    }

    pub(crate) fn observe(&mut self, now: Instant, demand: usize) {
        self.decay(now, true);
        self.level = self.level.max(demand as f64);
    }

    /// The envelope, rounded up: a fraction of a slot is still a slot.
    pub(crate) fn level(&mut self, now: Instant) -> usize {
        self.decay(now, false);
        self.level.ceil() as usize
    }

    fn decay(&mut self, now: Instant, observation: bool) {
        match self.clock {
            FilterClock::WallTime { time_constant } => {
                let dt = now.saturating_duration_since(self.updated);
                if time_constant > Duration::ZERO {
                    self.level *= (-dt.as_secs_f64() / time_constant.as_secs_f64()).exp();
                }
                self.updated = now;
            }
            FilterClock::ClaimCount { claims } => {
                if observation && claims > 0 {
                    self.level *= (-1.0 / f64::from(claims)).exp();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn name(s: &str) -> backend::Name {
        backend::Name::new(s)
    }

    fn view(id: SlotId, backend: &str, phase: Phase) -> SlotView {
        SlotView {
            id,
            backend: name(backend),
            phase,
            monitor: false,
            unwanted: false,
        }
    }

    fn monitor_view(id: SlotId, backend: &str, phase: Phase) -> SlotView {
        SlotView {
            monitor: true,
            ..view(id, backend, phase)
        }
    }

    fn creates_for(actions: &[Action], backend: &str) -> usize {
        actions
            .iter()
            .filter(|a| *a == &Action::Create { backend: name(backend) })
            .count()
    }

    #[test]
    fn distributes_target_evenly_with_remainder_to_earliest() {
        let healthy = [name("a"), name("b"), name("c")];
        let actions = plan(&PlanInput {
            healthy: &healthy,
            dead: &[],
            slots: &[],
            target: 7,
            max: 16,
        });

        assert_eq!(creates_for(&actions, "a"), 3);
        assert_eq!(creates_for(&actions, "b"), 2);
        assert_eq!(creates_for(&actions, "c"), 2);
    }

    #[test]
    fn caps_per_backend_at_max() {
        let healthy = [name("a")];
        let actions = plan(&PlanInput {
            healthy: &healthy,
            dead: &[],
            slots: &[],
            target: 10,
            max: 4,
        });
        assert_eq!(creates_for(&actions, "a"), 4);
    }

    #[test]
    fn tops_up_a_partially_filled_backend() {
        let healthy = [name("a"), name("b")];
        let slots = [
            view(1, "a", Phase::Idle),
            view(2, "a", Phase::Claimed),
            view(3, "b", Phase::Starting),
        ];
        let actions = plan(&PlanInput {
            healthy: &healthy,
            dead: &[],
            slots: &slots,
            target: 4,
            max: 16,
        });

        assert_eq!(actions.len(), 1);
        assert_eq!(creates_for(&actions, "b"), 1);
    }

    #[test]
    fn retires_surplus_cheapest_first() {
        let healthy = [name("a")];
        let slots = [
            view(1, "a", Phase::Claimed),
            view(2, "a", Phase::Idle),
            view(3, "a", Phase::Starting),
            view(4, "a", Phase::Idle),
        ];
        let actions = plan(&PlanInput {
            healthy: &healthy,
            dead: &[],
            slots: &slots,
            target: 2,
            max: 16,
        });

        // Two must go: the starting slot, then the lower-numbered idle one.
        assert_eq!(
            actions,
            vec![Action::Retire { slot: 3 }, Action::Retire { slot: 2 }],
        );
    }

    #[test]
    fn never_touches_draining_slots() {
        let healthy = [name("a")];
        let mut unwanted = view(2, "a", Phase::Idle);
        unwanted.unwanted = true;
        let slots = [
            view(1, "a", Phase::Closing),
            unwanted,
            view(3, "a", Phase::Idle),
        ];
        let actions = plan(&PlanInput {
            healthy: &healthy,
            dead: &[],
            slots: &slots,
            target: 1,
            max: 16,
        });

        // Surplus of two, but both are already on their way out.
        assert_eq!(actions, vec![Action::Retire { slot: 3 }]);
    }

    #[test]
    fn dead_backends_get_exactly_one_monitor() {
        let healthy = [name("a")];
        let dead = [name("b"), name("c")];
        let slots = [
            view(1, "a", Phase::Idle),
            monitor_view(2, "b", Phase::Starting),
        ];
        let actions = plan(&PlanInput {
            healthy: &healthy,
            dead: &dead,
            slots: &slots,
            target: 1,
            max: 16,
        });

        assert_eq!(actions, vec![Action::CreateMonitor { backend: name("c") }]);
    }

    #[test]
    fn monitors_do_not_count_against_normal_targets() {
        // A recovered backend whose monitor is still draining must get its
        // full complement of normal slots.
        let healthy = [name("a")];
        let slots = [monitor_view(1, "a", Phase::Closing)];
        let actions = plan(&PlanInput {
            healthy: &healthy,
            dead: &[],
            slots: &slots,
            target: 2,
            max: 16,
        });

        assert_eq!(creates_for(&actions, "a"), 2);
    }

    #[test]
    fn demand_filter_tracks_peaks_and_decays() {
        let start = Instant::now();
        let mut filter = DemandFilter {
            clock: FilterClock::WallTime {
                time_constant: Duration::from_secs(5),
            },
            level: 0.0,
            updated: start,
        };

        filter.observe(start, 10);
        assert_eq!(filter.level(start), 10);

        // A lower observation does not drag the envelope down.
        filter.observe(start, 3);
        assert_eq!(filter.level(start), 10);

        // One time constant later the envelope has decayed to ~37%.
        let later = start + Duration::from_secs(5);
        assert_eq!(filter.level(later), 4);

        // And a new peak snaps it back up.
        filter.observe(later, 8);
        assert_eq!(filter.level(later), 8);
    }

    #[test]
    fn demand_filter_claim_count_clock_ignores_wall_time() {
        let start = Instant::now();
        let mut filter = DemandFilter {
            clock: FilterClock::ClaimCount { claims: 1 },
            level: 0.0,
            updated: start,
        };

        filter.observe(start, 10);
        // Hours pass without claims: the envelope holds.
        assert_eq!(filter.level(start + Duration::from_secs(3600)), 10);

        // Each observation decays the envelope by one step; with a constant
        // of one claim, a single quiet observation drops it to 10/e.
        filter.observe(start, 0);
        assert_eq!(filter.level(start), 4);
    }
}
