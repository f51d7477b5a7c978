//! Utilities to help with testing tether

use crate::backend::{self, Backend, Connector};
use crate::resolver::{Resolver, ResolverState, Snapshot};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// A scriptable connector: backends can be told to refuse the next N
/// connection attempts, or to invalidate every connection they have handed
/// out. Connections are plain serial numbers.
///
/// All operations complete immediately, so tests under a paused clock see
/// exact attempt schedules.
pub(crate) struct TestConnector {
    next_serial: AtomicUsize,
    attempts: Mutex<HashMap<String, usize>>,
    fail_budget: Mutex<HashMap<String, usize>>,
    invalid: Mutex<HashSet<String>>,
}

impl TestConnector {
    pub(crate) fn new() -> Self {
        Self {
            next_serial: AtomicUsize::new(0),
            attempts: Mutex::new(HashMap::new()),
            fail_budget: Mutex::new(HashMap::new()),
            invalid: Mutex::new(HashSet::new()),
        }
    }

    /// Refuse the next `n` connection attempts to `backend`.
    pub(crate) fn fail_next(&self, backend: &str, n: usize) {
        self.fail_budget
            .lock()
            .unwrap()
            .insert(backend.to_string(), n);
    }

    /// Fail validity checks for every connection to `backend` from now on.
    pub(crate) fn invalidate(&self, backend: &str) {
        self.invalid.lock().unwrap().insert(backend.to_string());
    }

    /// Let `backend` hand out valid connections again.
    pub(crate) fn restore(&self, backend: &str) {
        self.fail_budget.lock().unwrap().remove(backend);
        self.invalid.lock().unwrap().remove(backend);
    }

    /// How many connection attempts `backend` has seen.
    pub(crate) fn attempts(&self, backend: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(backend)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for TestConnector {
    type Connection = usize;

    async fn connect(&self, backend: &Backend) -> Result<Self::Connection, backend::Error> {
        let key = backend.name().0;
        *self.attempts.lock().unwrap().entry(key.clone()).or_insert(0) += 1;

        let mut budget = self.fail_budget.lock().unwrap();
        if let Some(remaining) = budget.get_mut(&key) {
            if *remaining > 0 {
                *remaining = remaining.saturating_sub(1);
                return Err(anyhow::anyhow!("scripted connection refusal").into());
            }
        }
        drop(budget);

        if self.invalid.lock().unwrap().contains(&key) {
            return Err(anyhow::anyhow!("backend marked unreachable").into());
        }

        Ok(self.next_serial.fetch_add(1, Ordering::SeqCst))
    }

    async fn is_valid(&self, _conn: &mut Self::Connection) -> Result<(), backend::Error> {
        // Validity is scripted per backend, but connections do not know
        // their backend; a single poisoned backend fails every check, which
        // is precise enough for single-backend slot tests. Pool tests use
        // `fail_next` + claim verdicts instead.
        if self.invalid.lock().unwrap().is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("scripted validity failure").into())
        }
    }
}

/// A resolver driven by hand: tests add and remove backends and flip the
/// steady-state flag.
#[derive(Clone)]
pub(crate) struct TestResolver {
    tx: watch::Sender<Snapshot>,
    backends: Arc<Mutex<BTreeMap<backend::Name, Backend>>>,
}

impl TestResolver {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(Snapshot {
            state: ResolverState::Starting,
            backends: Arc::new(BTreeMap::new()),
        });
        Self {
            tx,
            backends: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub(crate) fn add(&self, address: &str) {
        let backend = Backend::new(address.parse().unwrap());
        self.backends
            .lock()
            .unwrap()
            .insert(backend.name(), backend);
        self.publish(ResolverState::SteadyState);
    }

    pub(crate) fn remove(&self, address: &str) {
        self.backends
            .lock()
            .unwrap()
            .remove(&backend::Name::new(address));
        self.publish(ResolverState::SteadyState);
    }

    pub(crate) fn mark_steady(&self) {
        self.publish(ResolverState::SteadyState);
    }

    fn publish(&self, state: ResolverState) {
        let backends = Arc::new(self.backends.lock().unwrap().clone());
        self.tx.send_replace(Snapshot { state, backends });
    }
}

impl Resolver for TestResolver {
    fn monitor(&mut self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }
}
