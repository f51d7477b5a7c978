//! A pool which uses a [resolver] to find a [backend], and vend out a [claim]

use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend;
use crate::claim;
use crate::codel::Controller;
use crate::connection::Connection;
use crate::policy::{OverloadPolicy, Policy};
use crate::rebalancer::{self, DemandFilter, Phase, PlanInput, SlotView};
use crate::recovery::{CONNECT_ACTION, INITIAL_ACTION};
use crate::resolver::{BoxedResolver, ResolverState, Snapshot};
use crate::slot::{self, ClaimId, Mode, SlotId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("No backends found for this service")]
    NoBackends,

    #[error("Claim timed out waiting for a connection")]
    ClaimTimeout,

    #[error("Claim was cancelled before it could be served")]
    ClaimCancelled,

    #[error("Every known backend is dead")]
    PoolFailed,

    #[error("Pool is stopping")]
    PoolStopping,

    #[error("Claim shed: the pool is overloaded")]
    Overloaded,

    #[error(transparent)]
    Policy(#[from] crate::policy::Error),

    #[error("Pool terminated")]
    Terminated,
}

/// Pool lifecycle states, observable through [Pool::state_monitor].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Waiting for the resolver's first report.
    Starting,
    /// Serving claims.
    Running,
    /// Every known backend is dead; claims fail until a monitor gets
    /// through.
    Failed,
    /// Draining slots after [Pool::stop].
    Stopping,
    /// Terminal.
    Stopped,
}

/// A point-in-time description of one backend, as reported by
/// [Pool::stats].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub alive: bool,
    /// Live slots targeting this backend, monitors excluded.
    pub slots: usize,
    pub ready: usize,
    pub claimed: usize,
}

/// A point-in-time description of the pool.
#[derive(Clone, Debug)]
pub struct Stats {
    pub state: State,
    pub queue_depth: usize,
    pub backends: BTreeMap<backend::Name, BackendStats>,
}

enum Request<Conn: Connection> {
    Claim {
        timeout: Option<Duration>,
        tx: oneshot::Sender<Result<claim::Handle<Conn>, Error>>,
    },
    Stats {
        tx: oneshot::Sender<Stats>,
    },
    Stop {
        tx: oneshot::Sender<()>,
    },
}

// One row of the backend table.
struct BackendEntry {
    backend: backend::Backend,
    alive: bool,
    last_dead: Option<Instant>,
    /// Retracted by the resolver, but pinned by slots that still reference
    /// it.
    retired: bool,
    /// Whether any slot ever reached this backend; selects the recovery
    /// action for new slots.
    ever_connected: bool,
    added_seq: u64,
}

// The pool's mirror of one slot's state, updated from slot events.
struct SlotEntry {
    backend: backend::Name,
    phase: Phase,
    monitor: bool,
    unwanted: bool,
    idle_since: Option<Instant>,
    slot: slot::Slot,
}

// One queued claim. The claim-handle state machine lives here: a request is
// `waiting` while in the queue, `attempting` while an offer is in flight,
// and settles when its oneshot fires (or the caller drops the receiver,
// which is a cancellation).
struct ClaimRequest<Conn: Connection> {
    id: ClaimId,
    enqueued_at: Instant,
    deadline: Option<Instant>,
    tx: oneshot::Sender<Result<claim::Handle<Conn>, Error>>,
}

struct PoolInner<Conn: Connection> {
    policy: Policy,
    connector: backend::SharedConnector<Conn>,
    resolver: BoxedResolver,
    resolver_rx: watch::Receiver<Snapshot>,
    resolver_live: bool,

    rx: mpsc::Receiver<Request<Conn>>,
    events_tx: mpsc::UnboundedSender<slot::Event<Conn>>,
    events_rx: mpsc::UnboundedReceiver<slot::Event<Conn>>,

    state: State,
    state_tx: watch::Sender<State>,
    steady: bool,

    backends: BTreeMap<backend::Name, BackendEntry>,
    slots: BTreeMap<SlotId, SlotEntry>,
    ready: VecDeque<SlotId>,
    had_ready: bool,

    queue: VecDeque<ClaimRequest<Conn>>,
    attempting: HashMap<ClaimId, (SlotId, ClaimRequest<Conn>)>,

    controller: Controller,
    demand: DemandFilter,

    next_slot_id: SlotId,
    next_claim_id: ClaimId,
    next_backend_seq: u64,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

impl<Conn: Connection> PoolInner<Conn> {
    async fn run(mut self) {
        info!(domain = ?self.policy.domain, "pool starting");

        // The watch channel is born holding a snapshot; apply it before
        // waiting for changes.
        self.handle_resolver_update().await;

        let mut check = interval_at(
            Instant::now() + self.policy.check_interval,
            self.policy.check_interval,
        );
        let mut decohere = self
            .policy
            .decoherence_interval
            .map(|period| interval_at(Instant::now() + period, period));

        while self.state != State::Stopped {
            let wake = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                request = self.rx.recv() => {
                    match request {
                        Some(request) => self.handle_request(request).await,
                        // Every Pool handle is gone; the task is aborted by
                        // Pool::drop, but bail out here in case it was not.
                        None => return,
                    }
                }
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_slot_event(event).await;
                    }
                }
                changed = self.resolver_rx.changed(), if self.resolver_live => {
                    match changed {
                        Ok(()) => self.handle_resolver_update().await,
                        // Keep serving from the last known backend set.
                        Err(_) => self.resolver_live = false,
                    }
                }
                _ = sleep_until(wake) => self.expire_claims(),
                _ = check.tick() => self.reclaim_idle().await,
                _ = async { decohere.as_mut().unwrap().tick().await },
                    if decohere.is_some() =>
                {
                    self.decohere();
                }
            }

            self.note_ready_transition();
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        info!(from = ?self.state, to = ?state, "pool state changed");
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    async fn handle_request(&mut self, request: Request<Conn>) {
        match request {
            Request::Claim { timeout, tx } => self.handle_claim(timeout, tx).await,
            Request::Stats { tx } => {
                let _ = tx.send(self.stats());
            }
            Request::Stop { tx } => self.begin_stop(Some(tx)).await,
        }
    }

    async fn handle_claim(
        &mut self,
        timeout: Option<Duration>,
        tx: oneshot::Sender<Result<claim::Handle<Conn>, Error>>,
    ) {
        match self.state {
            State::Stopping | State::Stopped => {
                let _ = tx.send(Err(Error::PoolStopping));
                return;
            }
            State::Failed => {
                let _ = tx.send(Err(Error::PoolFailed));
                return;
            }
            State::Starting | State::Running => {}
        }

        if self.steady && !self.backends.values().any(|b| !b.retired) {
            let _ = tx.send(Err(Error::NoBackends));
            return;
        }

        let now = Instant::now();
        let id = self.next_claim_id;
        self.next_claim_id += 1;
        let deadline = timeout.or(self.policy.claim_timeout).map(|t| now + t);
        self.queue.push_back(ClaimRequest {
            id,
            enqueued_at: now,
            deadline,
            tx,
        });

        let claimed = self
            .slots
            .values()
            .filter(|e| e.phase == Phase::Claimed)
            .count();
        self.demand.observe(now, claimed + self.queue.len());

        self.pair();
        if !self.queue.is_empty() {
            // Claim pressure with spare capacity: let the planner grow.
            self.replan().await;
        }
    }

    // Walk the queue head, pruning cancelled and expired claims, shedding
    // when the overload controller says so, and offering idle slots to the
    // rest in FIFO order. Offers resolve asynchronously through slot events.
    fn pair(&mut self) {
        let now = Instant::now();
        loop {
            let Some(head) = self.queue.front() else { break };
            if head.tx.is_closed() {
                let claim = self.queue.pop_front().unwrap();
                debug!(claim = claim.id, "claim cancelled while waiting");
                let _ = claim.tx.send(Err(Error::ClaimCancelled));
                continue;
            }
            if head.deadline.is_some_and(|d| now >= d) {
                let claim = self.queue.pop_front().unwrap();
                let _ = claim.tx.send(Err(Error::ClaimTimeout));
                continue;
            }

            let Some(slot_id) = self.ready.pop_front() else { break };
            let claim = self.queue.pop_front().unwrap();

            if self.controller.should_drop(claim.enqueued_at) {
                debug!(claim = claim.id, "claim shed under overload");
                let _ = claim.tx.send(Err(Error::Overloaded));
                self.ready.push_front(slot_id);
                continue;
            }

            let entry = self
                .slots
                .get(&slot_id)
                .expect("ready slots are registered");
            if entry.slot.offer(claim.id) {
                self.attempting.insert(claim.id, (slot_id, claim));
            } else {
                // The slot's task is already tearing down; put the claim
                // back and let the next ready slot have it. The slot is not
                // returned to the ready set.
                self.requeue(claim);
            }
        }
    }

    fn requeue(&mut self, claim: ClaimRequest<Conn>) {
        let at = self
            .queue
            .partition_point(|c| c.enqueued_at <= claim.enqueued_at);
        self.queue.insert(at, claim);
    }

    fn expire_claims(&mut self) {
        let now = Instant::now();
        let mut index = 0;
        while index < self.queue.len() {
            if self.queue[index].deadline.is_some_and(|d| now >= d) {
                let claim = self.queue.remove(index).unwrap();
                debug!(claim = claim.id, "claim timed out in queue");
                let _ = claim.tx.send(Err(Error::ClaimTimeout));
            } else {
                index += 1;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queue.iter().filter_map(|c| c.deadline).min()
    }

    async fn handle_slot_event(&mut self, event: slot::Event<Conn>) {
        match event {
            slot::Event::Ready { slot } => {
                let Some(entry) = self.slots.get_mut(&slot) else {
                    return;
                };
                let first = entry.phase == Phase::Starting;
                entry.phase = Phase::Idle;
                entry.idle_since = Some(Instant::now());
                if first {
                    info!(slot, backend = %entry.backend, "connected to backend");
                    if let Some(b) = self.backends.get_mut(&entry.backend) {
                        b.ever_connected = true;
                    }
                }
                if !entry.unwanted {
                    self.ready.push_back(slot);
                }
                self.pair();
            }
            slot::Event::LeftIdle { slot } => {
                self.ready.retain(|s| *s != slot);
                if let Some(entry) = self.slots.get_mut(&slot) {
                    entry.phase = Phase::Closing;
                    debug!(slot, backend = %entry.backend, "idle connection lost");
                }
            }
            slot::Event::ClaimAccepted {
                slot,
                claim_id,
                handle,
            } => {
                if let Some(entry) = self.slots.get_mut(&slot) {
                    entry.phase = Phase::Claimed;
                    entry.idle_since = None;
                }
                let Some((_, claim)) = self.attempting.remove(&claim_id) else {
                    // Unknown claim; dropping the handle sends the
                    // connection straight back to its slot.
                    return;
                };
                if matches!(self.state, State::Stopping | State::Stopped) {
                    let _ = claim.tx.send(Err(Error::PoolStopping));
                    return;
                }
                debug!(claim = claim_id, slot, "claim served");
                if claim.tx.send(Ok(handle.0)).is_err() {
                    // The claimant gave up while the offer was in flight;
                    // the returned handle was dropped by `send`, which
                    // releases the connection back to the slot.
                    debug!(claim = claim_id, "claim cancelled during handshake");
                }
            }
            slot::Event::ClaimRejected { slot, claim_id } => {
                debug!(claim = claim_id, slot, "claim offer rejected");
                self.resolve_rejected(claim_id);
                self.pair();
            }
            slot::Event::Exhausted { slot, backend } => {
                self.ready.retain(|s| *s != slot);
                if let Some(entry) = self.slots.get_mut(&slot) {
                    entry.phase = Phase::Closing;
                }
                self.mark_dead(backend).await;
            }
            slot::Event::MonitorConnected { slot, backend } => {
                if let Some(entry) = self.slots.get_mut(&slot) {
                    entry.phase = Phase::Closing;
                }
                if let Some(b) = self.backends.get_mut(&backend) {
                    if !b.alive {
                        b.alive = true;
                        b.ever_connected = true;
                        let down_for = b.last_dead.map(|at| at.elapsed());
                        info!(%backend, ?down_for, "backend recovered");
                    }
                }
                if self.state == State::Failed {
                    self.set_state(State::Running);
                }
                self.replan().await;
            }
            slot::Event::Stopped { slot } => {
                self.ready.retain(|s| *s != slot);
                let Some(entry) = self.slots.remove(&slot) else {
                    return;
                };
                debug!(slot, backend = %entry.backend, "closed connection slot");

                // Offers that were in flight toward this slot resolve as
                // rejections.
                let stale: Vec<ClaimId> = self
                    .attempting
                    .iter()
                    .filter(|(_, (sid, _))| *sid == slot)
                    .map(|(cid, _)| *cid)
                    .collect();
                for claim_id in stale {
                    self.resolve_rejected(claim_id);
                }

                // A retired backend with no remaining slots leaves the
                // table.
                if let Some(b) = self.backends.get(&entry.backend) {
                    if b.retired && !self.slots.values().any(|e| e.backend == entry.backend) {
                        self.backends.remove(&entry.backend);
                    }
                }

                match self.state {
                    State::Stopping => {
                        if self.slots.is_empty() {
                            self.finish_stop();
                        }
                    }
                    State::Running | State::Failed => {
                        self.replan().await;
                        self.pair();
                    }
                    _ => {}
                }
            }
        }
    }

    // A rejected (or impossible) offer: the claim goes back to the queue in
    // FIFO position, unless the pool as a whole can no longer serve it.
    fn resolve_rejected(&mut self, claim_id: ClaimId) {
        let Some((_, claim)) = self.attempting.remove(&claim_id) else {
            return;
        };
        match self.state {
            State::Failed => {
                let _ = claim.tx.send(Err(Error::PoolFailed));
            }
            State::Stopping | State::Stopped => {
                let _ = claim.tx.send(Err(Error::PoolStopping));
            }
            _ => self.requeue(claim),
        }
    }

    // The dead-backend protocol (§ recovery): mark it dead, drain its other
    // slots, ensure a monitor, and fail the pool if nothing is left alive.
    async fn mark_dead(&mut self, backend: backend::Name) {
        warn!(%backend, "backend exhausted its retry budget");

        let Some(entry) = self.backends.get_mut(&backend) else {
            self.replan().await;
            return;
        };
        if entry.retired {
            // Already being forgotten; no monitor for it.
            self.replan().await;
            return;
        }
        if entry.alive {
            entry.alive = false;
            entry.last_dead = Some(Instant::now());

            let drain: Vec<SlotId> = self
                .slots
                .iter()
                .filter(|(_, e)| {
                    e.backend == backend && !e.monitor && e.phase != Phase::Closing && !e.unwanted
                })
                .map(|(id, _)| *id)
                .collect();
            for id in drain {
                self.retire_slot(id).await;
            }
        }

        self.replan().await;

        let any_alive = self.backends.values().any(|b| !b.retired && b.alive);
        let any_known = self.backends.values().any(|b| !b.retired);
        if self.state == State::Running && any_known && !any_alive {
            self.set_state(State::Failed);
            // Invariant: a failed pool holds no queued claims.
            for claim in self.queue.drain(..) {
                let _ = claim.tx.send(Err(Error::PoolFailed));
            }
        }
    }

    async fn handle_resolver_update(&mut self) {
        let snapshot = self.resolver_rx.borrow_and_update().clone();
        self.steady = snapshot.state == ResolverState::SteadyState;
        if matches!(self.state, State::Stopping | State::Stopped) {
            return;
        }

        for (name, b) in snapshot.backends.iter() {
            match self.backends.get_mut(name) {
                Some(entry) => entry.retired = false,
                None => {
                    info!(backend = %name, "backend added");
                    self.backends.insert(
                        name.clone(),
                        BackendEntry {
                            backend: b.clone(),
                            alive: true,
                            last_dead: None,
                            retired: false,
                            ever_connected: false,
                            added_seq: self.next_backend_seq,
                        },
                    );
                    self.next_backend_seq += 1;
                }
            }
        }

        let removed: Vec<backend::Name> = self
            .backends
            .iter()
            .filter(|(name, e)| !e.retired && !snapshot.backends.contains_key(*name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in removed {
            info!(backend = %name, "backend removed");
            let pinned: Vec<SlotId> = self
                .slots
                .iter()
                .filter(|(_, e)| e.backend == name)
                .map(|(id, _)| *id)
                .collect();
            if pinned.is_empty() {
                self.backends.remove(&name);
            } else {
                // Keep the entry until its slots drain; claimed connections
                // are never torn out from under their claimants.
                self.backends.get_mut(&name).unwrap().retired = true;
                for id in pinned {
                    self.retire_slot(id).await;
                }
            }
        }

        if self.state == State::Starting && (self.steady || !self.backends.is_empty()) {
            self.set_state(State::Running);
        }
        if self.state == State::Failed
            && self.backends.values().any(|b| !b.retired && b.alive)
        {
            // The resolver found something new to try while we were failed.
            self.set_state(State::Running);
        }

        if self.steady && !self.backends.values().any(|b| !b.retired) {
            for claim in self.queue.drain(..) {
                let _ = claim.tx.send(Err(Error::NoBackends));
            }
        }

        self.replan().await;
        self.pair();
    }

    // Reconcile the slot population with the planner's desired distribution.
    async fn replan(&mut self) {
        if !matches!(self.state, State::Running | State::Failed) {
            return;
        }

        let now = Instant::now();
        let demand = self.demand.level(now);
        let target = std::cmp::min(
            self.policy.maximum,
            std::cmp::max(self.policy.target(), demand),
        );

        let mut healthy: Vec<(u64, backend::Name)> = self
            .backends
            .iter()
            .filter(|(_, e)| !e.retired && e.alive)
            .map(|(name, e)| (e.added_seq, name.clone()))
            .collect();
        healthy.sort();
        let healthy: Vec<backend::Name> = healthy.into_iter().map(|(_, name)| name).collect();

        let dead: Vec<backend::Name> = self
            .backends
            .iter()
            .filter(|(_, e)| !e.retired && !e.alive)
            .map(|(name, _)| name.clone())
            .collect();

        let views: Vec<SlotView> = self
            .slots
            .iter()
            .map(|(id, e)| SlotView {
                id: *id,
                backend: e.backend.clone(),
                phase: e.phase,
                monitor: e.monitor,
                unwanted: e.unwanted,
            })
            .collect();

        let actions = rebalancer::plan(&PlanInput {
            healthy: &healthy,
            dead: &dead,
            slots: &views,
            target,
            max: self.policy.maximum,
        });

        for action in actions {
            match action {
                rebalancer::Action::Create { backend } => {
                    self.spawn_slot(backend, Mode::Normal);
                }
                rebalancer::Action::CreateMonitor { backend } => {
                    self.spawn_slot(backend, Mode::Monitor);
                }
                rebalancer::Action::Retire { slot } => {
                    self.retire_slot(slot).await;
                }
            }
        }
    }

    fn spawn_slot(&mut self, name: backend::Name, mode: Mode) {
        let Some(entry) = self.backends.get(&name) else {
            return;
        };
        let id = self.next_slot_id;
        self.next_slot_id += 1;

        let action = if entry.ever_connected {
            CONNECT_ACTION
        } else {
            INITIAL_ACTION
        };
        let mut retry = self.policy.recovery.policy(action).clone();
        if retry.max_delay.is_none() {
            retry.max_delay = Some(self.policy.max_chained_backoff);
        }
        if mode == Mode::Monitor {
            retry = retry.monitor_policy();
        }

        debug!(slot = id, backend = %name, ?mode, "slot created");
        let slot = slot::Slot::spawn(
            slot::Config {
                id,
                backend: entry.backend.clone(),
                mode,
                policy: retry,
                check_interval: self.policy.check_interval,
                check_timeout: self.policy.check_timeout,
            },
            self.connector.clone(),
            self.events_tx.clone(),
        );
        self.slots.insert(
            id,
            SlotEntry {
                backend: name,
                phase: Phase::Starting,
                monitor: mode == Mode::Monitor,
                unwanted: false,
                idle_since: None,
                slot,
            },
        );
    }

    async fn retire_slot(&mut self, id: SlotId) {
        self.ready.retain(|s| *s != id);
        if let Some(entry) = self.slots.get_mut(&id) {
            if !entry.unwanted {
                entry.unwanted = true;
                entry.slot.set_unwanted().await;
            }
        }
    }

    // Idle reclamation: connections that sat unclaimed past the overload
    // controller's ceiling are recycled to shrink a pool that grew for a
    // burst.
    async fn reclaim_idle(&mut self) {
        if self.state != State::Running {
            return;
        }
        let max_idle = self.controller.get_max_idle();
        if max_idle == Duration::MAX {
            return;
        }
        let now = Instant::now();
        let stale: Vec<SlotId> = self
            .ready
            .iter()
            .filter(|id| {
                self.slots
                    .get(*id)
                    .and_then(|e| e.idle_since)
                    .is_some_and(|since| now.saturating_duration_since(since) > max_idle)
            })
            .copied()
            .collect();
        for id in stale {
            debug!(slot = id, "reclaiming overlong idle connection");
            self.retire_slot(id).await;
        }
    }

    fn decohere(&mut self) {
        use rand::seq::SliceRandom;
        if self.ready.len() > 1 {
            debug!(ready = self.ready.len(), "decohering ready set");
            self.ready.make_contiguous().shuffle(&mut rand::rng());
        }
    }

    // Called after every handler: the overload controller learns when the
    // pool ran out of idle connections.
    fn note_ready_transition(&mut self) {
        let has_ready = !self.ready.is_empty();
        if self.had_ready && !has_ready {
            self.controller.queue_cleared();
        }
        self.had_ready = has_ready;
    }

    async fn begin_stop(&mut self, tx: Option<oneshot::Sender<()>>) {
        if let Some(tx) = tx {
            self.stop_waiters.push(tx);
        }
        match self.state {
            State::Stopped => {
                for tx in self.stop_waiters.drain(..) {
                    let _ = tx.send(());
                }
                return;
            }
            State::Stopping => return,
            _ => {}
        }

        self.set_state(State::Stopping);
        for claim in self.queue.drain(..) {
            let _ = claim.tx.send(Err(Error::PoolStopping));
        }

        let ids: Vec<SlotId> = self.slots.keys().copied().collect();
        for id in ids {
            self.retire_slot(id).await;
        }
        self.resolver.terminate().await;

        if self.slots.is_empty() {
            self.finish_stop();
        }
    }

    fn finish_stop(&mut self) {
        self.set_state(State::Stopped);
        for tx in self.stop_waiters.drain(..) {
            let _ = tx.send(());
        }
    }

    fn stats(&self) -> Stats {
        let mut backends: BTreeMap<backend::Name, BackendStats> = self
            .backends
            .iter()
            .filter(|(_, e)| !e.retired)
            .map(|(name, e)| {
                (
                    name.clone(),
                    BackendStats {
                        alive: e.alive,
                        ..Default::default()
                    },
                )
            })
            .collect();
        for entry in self.slots.values() {
            if entry.monitor {
                continue;
            }
            if let Some(stats) = backends.get_mut(&entry.backend) {
                stats.slots += 1;
                match entry.phase {
                    Phase::Idle => stats.ready += 1,
                    Phase::Claimed => stats.claimed += 1,
                    _ => {}
                }
            }
        }
        Stats {
            state: self.state,
            queue_depth: self.queue.len(),
            backends,
        }
    }
}

/// Manages a set of connections to a service.
pub struct Pool<Conn: Connection> {
    handle: tokio::task::JoinHandle<()>,
    tx: mpsc::Sender<Request<Conn>>,
    state_rx: watch::Receiver<State>,
}

impl<Conn: Connection> Pool<Conn> {
    /// Creates a new connection pool.
    ///
    /// - resolver: Describes how backends should be found for the service.
    /// - backend_connector: Describes how the connections to a specific
    ///   backend should be made.
    /// - policy: Sizing, claim, and recovery parameters; validated here.
    pub fn new(
        mut resolver: BoxedResolver,
        backend_connector: backend::SharedConnector<Conn>,
        policy: Policy,
    ) -> Result<Self, Error> {
        policy.validate()?;

        let (tx, rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(State::Starting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let resolver_rx = resolver.monitor();

        let controller = match &policy.overload {
            OverloadPolicy::Disabled => Controller::Disabled,
            OverloadPolicy::ModifiedCodel(params) => {
                Controller::Modified(crate::codel::ModifiedDelay::new(params.clone()))
            }
            OverloadPolicy::OriginalCodel(params) => {
                Controller::Original(crate::codel::ControlledDelay::new(params.clone()))
            }
        };
        let demand = DemandFilter::new(policy.filter);

        let inner = PoolInner {
            policy,
            connector: backend_connector,
            resolver,
            resolver_rx,
            resolver_live: true,
            rx,
            events_tx,
            events_rx,
            state: State::Starting,
            state_tx,
            steady: false,
            backends: BTreeMap::new(),
            slots: BTreeMap::new(),
            ready: VecDeque::new(),
            had_ready: false,
            queue: VecDeque::new(),
            attempting: HashMap::new(),
            controller,
            demand,
            next_slot_id: 0,
            next_claim_id: 0,
            next_backend_seq: 0,
            stop_waiters: Vec::new(),
        };
        let handle = tokio::task::spawn(inner.run());

        Ok(Self {
            handle,
            tx,
            state_rx,
        })
    }

    /// Acquires a handle to a connection within the connection pool,
    /// waiting up to the policy's claim timeout.
    ///
    /// Dropping the returned future cancels the claim.
    pub async fn claim(&self) -> Result<claim::Handle<Conn>, Error> {
        self.claim_with_timeout(None).await
    }

    /// As [Pool::claim], but `Some` overrides the policy's claim timeout
    /// for this claim only.
    pub async fn claim_with_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<claim::Handle<Conn>, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Claim { timeout, tx })
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    /// Observes pool state transitions.
    pub fn state_monitor(&self) -> watch::Receiver<State> {
        self.state_rx.clone()
    }

    /// A snapshot of the pool's backends, slots, and queue.
    pub async fn stats(&self) -> Result<Stats, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Stats { tx })
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }

    /// Gracefully stops the pool: queued claims fail with
    /// [Error::PoolStopping], slots drain (waiting out held claims), and
    /// the call returns once every slot has stopped.
    pub async fn stop(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Stop { tx })
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }
}

impl<Conn: Connection> Drop for Pool<Conn> {
    fn drop(&mut self) {
        self.handle.abort()
    }
}
