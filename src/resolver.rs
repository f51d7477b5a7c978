//! The interface for the resolver, which finds backends.

use crate::backend::{self, Backend};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

pub type AllBackends = Arc<BTreeMap<backend::Name, Backend>>;

/// Where a resolver is in its discovery of the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolverState {
    /// Initial discovery is still underway; an empty backend set means
    /// "not looked up yet", not "the service has no backends".
    Starting,

    /// The published set reflects the service as currently known.
    SteadyState,
}

/// One observation of a service's backends.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub state: ResolverState,
    pub backends: AllBackends,
}

/// Translates a service name into a set of backends.
///
/// The resolver is responsible for knowing which [crate::service::Name]
/// it is resolving. It is responsible for reporting the set of
/// all possible backends, but not reporting nor tracking their health.
///
/// The pool diffs successive snapshots to observe backends being added and
/// removed, and uses [Snapshot::state] to tell an empty set apart from a
/// lookup that has not completed yet.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Start running a resolver.
    ///
    /// Returns a receiver to track ongoing activity.
    fn monitor(&mut self) -> watch::Receiver<Snapshot>;

    /// Cleanly terminates the resolver.
    ///
    /// This ensures that background tasks, if they exist, have stopped.
    async fn terminate(&mut self) {}
}

/// Helper type for anything that implements the Resolver interface.
pub type BoxedResolver = Box<dyn Resolver>;
