//! Slots: the pool's ongoing intents to each hold one connection.
//!
//! A slot owns exactly one backend key and one socket manager for its whole
//! life. It runs as its own task: the pool talks to it through a small
//! request channel, and the slot reports spontaneous transitions back on the
//! pool's event channel. Claimed connections come back through a private
//! return channel whose send permit is reserved at claim time, so a release
//! can neither fail nor reach the wrong slot.
//!
//! Slots scale up and down in quantity at the request of the rebalancer.

use crate::backend::{self, Backend, SharedConnector};
use crate::claim;
use crate::connection::Connection;
use crate::recovery::RetryPolicy;
use crate::socket::{Failure, SocketMgr, SocketState};

use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Duration, Instant};
use tracing::debug;

/// An arbitrary opaque identifier for a slot, to distinguish it from
/// other slots which already exist.
pub(crate) type SlotId = usize;

/// Identifies one outstanding claim during the offer handshake.
pub(crate) type ClaimId = u64;

/// Whether a slot holds a place in the normal population, or probes a dead
/// backend for recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Normal,
    Monitor,
}

/// A request which may be sent to a slot.
#[derive(Debug)]
pub(crate) enum Request {
    /// Offer the identified claim to this slot. The slot answers with
    /// [Event::ClaimAccepted] or [Event::ClaimRejected].
    Claim { claim_id: ClaimId },

    /// Mark the slot unwanted: drain at the next opportunity.
    SetUnwanted,
}

/// Spontaneous slot transitions reported to the pool.
#[derive_where(Debug)]
pub(crate) enum Event<Conn: Connection> {
    /// The slot's connection is open and unclaimed; it may join the ready
    /// set.
    Ready { slot: SlotId },

    /// The slot's idle connection died; it has left the ready set and is
    /// draining.
    LeftIdle { slot: SlotId },

    /// Second half of the claim handshake.
    ClaimAccepted {
        slot: SlotId,
        claim_id: ClaimId,
        handle: DebugIgnore<claim::Handle<Conn>>,
    },
    ClaimRejected { slot: SlotId, claim_id: ClaimId },

    /// The slot's retry budget ran out before a connection was established.
    Exhausted { slot: SlotId, backend: backend::Name },

    /// A monitor slot reached its dead backend.
    MonitorConnected { slot: SlotId, backend: backend::Name },

    /// Terminal: the slot has torn down and its task is exiting.
    Stopped { slot: SlotId },
}

/// The connection and verdict a claimant returns to its slot.
pub(crate) struct Returned<Conn: Connection> {
    pub(crate) conn: Conn,
    pub(crate) ok: bool,
}

/// Knobs for one slot task.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) id: SlotId,
    pub(crate) backend: Backend,
    pub(crate) mode: Mode,
    /// Already monitor-derived when `mode` is [Mode::Monitor].
    pub(crate) policy: RetryPolicy,
    pub(crate) check_interval: Duration,
    pub(crate) check_timeout: Duration,
}

// What the worker does after finishing one phase of the slot's life.
enum Step<Conn: Connection> {
    Idle(DebugIgnore<Conn>),
    Claimed,
    Closing,
}

struct Worker<Conn: Connection> {
    config: Config,
    connector: SharedConnector<Conn>,
    mgr: SocketMgr,
    unwanted: bool,
    pool_gone: bool,

    rx: mpsc::Receiver<Request>,
    events: mpsc::UnboundedSender<Event<Conn>>,

    // Return path for claimed connections; capacity 1, permit reserved at
    // claim time.
    return_tx: mpsc::Sender<Returned<Conn>>,
    return_rx: mpsc::Receiver<Returned<Conn>>,
}

impl<Conn: Connection> Worker<Conn> {
    async fn run(mut self) {
        let mut step = self.start().await;
        loop {
            match step {
                Step::Idle(conn) => step = self.idle(conn.0).await,
                Step::Claimed => step = self.claimed().await,
                Step::Closing => break,
            }
        }

        // Reject any offer that raced with the decision to close, so the
        // pool never waits on a handshake that cannot complete.
        while let Ok(req) = self.rx.try_recv() {
            if let Request::Claim { claim_id } = req {
                self.reject(claim_id);
            }
        }

        self.mgr.destroy();
        self.emit(Event::Stopped {
            slot: self.config.id,
        });
    }

    // The starting phase: drive the socket manager until a connection is
    // established or the retry budget runs out.
    async fn start(&mut self) -> Step<Conn> {
        self.mgr.connect(Instant::now());
        loop {
            if self.unwanted {
                return Step::Closing;
            }
            match self.mgr.state() {
                SocketState::Delay { until } => {
                    tokio::select! {
                        req = self.rx.recv(), if !self.pool_gone => {
                            self.handle_aside(req);
                        }
                        _ = sleep_until(until) => {
                            self.mgr.begin_attempt();
                        }
                    }
                }
                SocketState::Connecting { timeout: attempt_timeout } => {
                    if let Some(conn) = self.attempt(attempt_timeout).await {
                        self.mgr.on_connected();
                        return self.connected(conn);
                    }
                }
                SocketState::Error { exhausted: false } => {
                    self.mgr.retry(Instant::now());
                }
                SocketState::Error { exhausted: true } => {
                    debug!(
                        slot = self.config.id,
                        backend = %self.config.backend.name(),
                        attempts = self.mgr.current_attempt(),
                        overloaded = self.mgr.overloaded(),
                        "slot exhausted its retry budget",
                    );
                    self.emit(Event::Exhausted {
                        slot: self.config.id,
                        backend: self.config.backend.name(),
                    });
                    return Step::Closing;
                }
                SocketState::Stopped
                | SocketState::Connected
                | SocketState::Closed => {
                    unreachable!("socket manager cannot settle here while starting")
                }
            }
        }
    }

    // One connection attempt, still answering pool requests while it runs.
    async fn attempt(&mut self, attempt_timeout: Duration) -> Option<Conn> {
        let connector = self.connector.clone();
        let backend = self.config.backend.clone();
        let connect = timeout(attempt_timeout, async move {
            connector.connect(&backend).await
        });
        tokio::pin!(connect);
        loop {
            tokio::select! {
                req = self.rx.recv(), if !self.pool_gone => {
                    self.handle_aside(req);
                    if self.unwanted {
                        return None;
                    }
                }
                res = &mut connect => {
                    match res {
                        Ok(Ok(conn)) => return Some(conn),
                        Ok(Err(err)) => {
                            debug!(
                                slot = self.config.id,
                                backend = %self.config.backend.name(),
                                attempt = self.mgr.current_attempt(),
                                %err,
                                "connection attempt failed",
                            );
                            self.mgr.on_error(Failure::Error);
                        }
                        Err(_) => {
                            debug!(
                                slot = self.config.id,
                                backend = %self.config.backend.name(),
                                attempt = self.mgr.current_attempt(),
                                "connection attempt timed out",
                            );
                            self.mgr.on_error(Failure::Timeout);
                        }
                    }
                    return None;
                }
            }
        }
    }

    fn connected(&mut self, conn: Conn) -> Step<Conn> {
        if self.config.mode == Mode::Monitor {
            // The probe's work is done; the connection itself is not kept.
            self.emit(Event::MonitorConnected {
                slot: self.config.id,
                backend: self.config.backend.name(),
            });
            return Step::Closing;
        }
        if self.unwanted {
            return Step::Closing;
        }
        self.emit(Event::Ready {
            slot: self.config.id,
        });
        Step::Idle(DebugIgnore(conn))
    }

    // Idle: hold the open connection, serve claim offers, and watch for the
    // connection dying underneath us.
    async fn idle(&mut self, mut conn: Conn) -> Step<Conn> {
        loop {
            tokio::select! {
                req = self.rx.recv(), if !self.pool_gone => {
                    match req {
                        Some(Request::Claim { claim_id }) => {
                            let Ok(permit) = self.return_tx.clone().try_reserve_owned() else {
                                // Capacity 1 and no claimant outstanding;
                                // failing means the worker is being torn
                                // down mid-offer.
                                self.reject(claim_id);
                                return Step::Closing;
                            };
                            let handle = claim::Handle::new(conn, permit);
                            self.emit(Event::ClaimAccepted {
                                slot: self.config.id,
                                claim_id,
                                handle: DebugIgnore(handle),
                            });
                            return Step::Claimed;
                        }
                        other => {
                            self.handle_aside(other);
                            return Step::Closing;
                        }
                    }
                }
                _ = sleep(self.config.check_interval) => {
                    let valid = timeout(
                        self.config.check_timeout,
                        self.connector.is_valid(&mut conn),
                    )
                    .await;
                    if !matches!(valid, Ok(Ok(()))) {
                        debug!(
                            slot = self.config.id,
                            backend = %self.config.backend.name(),
                            "idle connection failed its validity check",
                        );
                        self.mgr.on_closed();
                        self.emit(Event::LeftIdle {
                            slot: self.config.id,
                        });
                        return Step::Closing;
                    }
                }
            }
        }
    }

    // Claimed: the connection is out with a claimant; wait for it to come
    // back and decide whether it may serve again.
    async fn claimed(&mut self) -> Step<Conn> {
        loop {
            tokio::select! {
                ret = self.return_rx.recv() => {
                    let Some(Returned { mut conn, ok }) = ret else {
                        return Step::Closing;
                    };
                    if !ok {
                        self.mgr.on_closed();
                        return Step::Closing;
                    }
                    if self.unwanted || self.pool_gone {
                        return Step::Closing;
                    }
                    // Revalidate before rejoining the ready set; the claimant
                    // may not have noticed the transport dying.
                    let valid = timeout(
                        self.config.check_timeout,
                        self.connector.is_valid(&mut conn),
                    )
                    .await;
                    if !matches!(valid, Ok(Ok(()))) {
                        self.mgr.on_closed();
                        return Step::Closing;
                    }
                    self.emit(Event::Ready {
                        slot: self.config.id,
                    });
                    return Step::Idle(DebugIgnore(conn));
                }
                req = self.rx.recv(), if !self.pool_gone => {
                    self.handle_aside(req);
                }
            }
        }
    }

    // Requests that arrive outside the state that consumes them: reject
    // offers, latch the unwanted flag, note a vanished pool.
    fn handle_aside(&mut self, req: Option<Request>) {
        match req {
            Some(Request::Claim { claim_id }) => self.reject(claim_id),
            Some(Request::SetUnwanted) => self.unwanted = true,
            None => {
                self.pool_gone = true;
                self.unwanted = true;
            }
        }
    }

    fn reject(&mut self, claim_id: ClaimId) {
        self.emit(Event::ClaimRejected {
            slot: self.config.id,
            claim_id,
        });
    }

    fn emit(&self, event: Event<Conn>) {
        // The pool may already be gone during teardown; nothing to do then.
        let _ = self.events.send(event);
    }
}

/// The pool-side handle to one spawned slot task.
#[derive(Debug)]
pub(crate) struct Slot {
    tx: mpsc::Sender<Request>,
}

impl Slot {
    /// Spawns the slot's worker task. The slot starts connecting
    /// immediately.
    pub(crate) fn spawn<Conn: Connection>(
        config: Config,
        connector: SharedConnector<Conn>,
        events: mpsc::UnboundedSender<Event<Conn>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let (return_tx, return_rx) = mpsc::channel(1);
        let mgr = SocketMgr::new(config.policy.clone());
        let worker = Worker {
            config,
            connector,
            mgr,
            unwanted: false,
            pool_gone: false,
            rx,
            events,
            return_tx,
            return_rx,
        };
        tokio::task::spawn(worker.run());
        Self { tx }
    }

    /// Offers a claim; a false return is a synthesized rejection (the slot
    /// is already tearing down).
    pub(crate) fn offer(&self, claim_id: ClaimId) -> bool {
        self.tx.try_send(Request::Claim { claim_id }).is_ok()
    }

    /// Asks the slot to drain at its next opportunity.
    pub(crate) async fn set_unwanted(&self) {
        let _ = self.tx.send(Request::SetUnwanted).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::recovery::Retries;
    use crate::test_utils::TestConnector;
    use std::sync::Arc;

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn config(id: SlotId, mode: Mode, retries: u32) -> Config {
        let policy = RetryPolicy {
            retries: Retries::Finite(retries),
            timeout: ms(1000),
            delay: ms(100),
            max_timeout: None,
            max_delay: None,
        };
        Config {
            id,
            backend: Backend::new("127.0.0.1:7000".parse().unwrap()),
            mode,
            policy: if mode == Mode::Monitor {
                policy.monitor_policy()
            } else {
                policy
            },
            check_interval: ms(30_000),
            check_timeout: ms(1000),
        }
    }

    struct Fixture {
        connector: Arc<TestConnector>,
        events: mpsc::UnboundedReceiver<Event<usize>>,
        slot: Slot,
    }

    fn spawn(mode: Mode, retries: u32) -> Fixture {
        let connector = Arc::new(TestConnector::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = Slot::spawn(config(1, mode, retries), connector.clone(), tx);
        Fixture {
            connector,
            events: rx,
            slot,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_serves_a_claim() {
        let mut f = spawn(Mode::Normal, 3);

        assert!(matches!(
            f.events.recv().await,
            Some(Event::Ready { slot: 1 })
        ));

        assert!(f.slot.offer(7));
        let Some(Event::ClaimAccepted {
            claim_id: 7,
            handle,
            ..
        }) = f.events.recv().await
        else {
            panic!("expected the offer to be accepted");
        };

        // Releasing in good standing puts the slot back in the ready set.
        handle.0.release();
        assert!(matches!(
            f.events.recv().await,
            Some(Event::Ready { slot: 1 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_release_retires_the_slot() {
        let mut f = spawn(Mode::Normal, 3);
        assert!(matches!(f.events.recv().await, Some(Event::Ready { .. })));

        assert!(f.slot.offer(1));
        let Some(Event::ClaimAccepted { handle, .. }) = f.events.recv().await else {
            panic!("expected the offer to be accepted");
        };

        handle.0.fail();
        assert!(matches!(f.events.recv().await, Some(Event::Stopped { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_follows_the_backoff_schedule() {
        let connector = Arc::new(TestConnector::new());
        connector.fail_next("127.0.0.1:7000", usize::MAX);
        let (tx, mut events) = mpsc::unbounded_channel::<Event<usize>>();
        let start = Instant::now();
        let _slot = Slot::spawn(config(1, Mode::Normal, 3), connector.clone(), tx);

        let Some(Event::Exhausted { backend, .. }) = events.recv().await else {
            panic!("expected exhaustion");
        };
        assert_eq!(backend, backend::Name::new("127.0.0.1:7000"));
        assert_eq!(connector.attempts("127.0.0.1:7000"), 3);
        // Attempts at 0, 100, and 300 ms; errors are immediate.
        assert_eq!(start.elapsed(), ms(300));

        assert!(matches!(events.recv().await, Some(Event::Stopped { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_reports_recovery_and_drains() {
        let mut f = spawn(Mode::Monitor, 3);
        f.connector.fail_next("127.0.0.1:7000", 2);

        let Some(Event::MonitorConnected { backend, .. }) = f.events.recv().await else {
            panic!("expected the monitor to reach the backend");
        };
        assert_eq!(backend, backend::Name::new("127.0.0.1:7000"));
        assert!(matches!(f.events.recv().await, Some(Event::Stopped { .. })));
        assert_eq!(f.connector.attempts("127.0.0.1:7000"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unwanted_idle_slot_drains_and_rejects_late_offers() {
        let mut f = spawn(Mode::Normal, 3);
        assert!(matches!(f.events.recv().await, Some(Event::Ready { .. })));

        f.slot.set_unwanted().await;
        // An offer racing with the drain is rejected, not dropped.
        f.slot.offer(9);

        let mut saw_reject = false;
        let mut saw_stop = false;
        while let Some(event) = f.events.recv().await {
            match event {
                Event::ClaimRejected { claim_id: 9, .. } => saw_reject = true,
                Event::Stopped { .. } => {
                    saw_stop = true;
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_reject && saw_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_idle_connection_is_detected() {
        let mut f = spawn(Mode::Normal, 3);
        assert!(matches!(f.events.recv().await, Some(Event::Ready { .. })));

        f.connector.invalidate("127.0.0.1:7000");
        // The next validity check notices and the slot drains.
        assert!(matches!(f.events.recv().await, Some(Event::LeftIdle { .. })));
        assert!(matches!(f.events.recv().await, Some(Event::Stopped { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn release_revalidates_before_rejoining() {
        let mut f = spawn(Mode::Normal, 3);
        assert!(matches!(f.events.recv().await, Some(Event::Ready { .. })));

        assert!(f.slot.offer(1));
        let Some(Event::ClaimAccepted { handle, .. }) = f.events.recv().await else {
            panic!("expected the offer to be accepted");
        };

        // The transport dies while claimed; an ok-release must not put the
        // connection back in service.
        f.connector.invalidate("127.0.0.1:7000");
        handle.0.release();
        assert!(matches!(f.events.recv().await, Some(Event::Stopped { .. })));
    }
}
