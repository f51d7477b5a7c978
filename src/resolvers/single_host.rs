//! Implementation of [Resolver] that always returns an explicit address.

use tokio::sync::watch;

use crate::backend;
use crate::resolver::{Resolver, ResolverState, Snapshot};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// A [`Resolver`] that always returns a single address.
#[derive(Clone, Debug)]
pub struct SingleHostResolver {
    tx: watch::Sender<Snapshot>,
}

impl SingleHostResolver {
    /// Construct a resolver to always return the provided address.
    pub fn new(address: SocketAddr) -> Self {
        let backend = backend::Backend::new(address);
        let backends = Arc::new(BTreeMap::from([(backend.name(), backend)]));
        let (tx, _rx) = watch::channel(Snapshot {
            state: ResolverState::SteadyState,
            backends,
        });
        Self { tx }
    }
}

impl Resolver for SingleHostResolver {
    fn monitor(&mut self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use crate::{backend::Backend, backend::Name, resolver::Resolver as _};

    use super::SingleHostResolver;

    #[test]
    fn single_host_resolver_returns_address() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4444);
        let mut res = SingleHostResolver::new(addr);
        let rx = res.monitor();
        let snapshot = rx.borrow();
        assert_eq!(snapshot.backends.len(), 1);
        let Backend { address } = snapshot
            .backends
            .get(&Name::new("127.0.0.1:4444"))
            .expect("Expected the configured backend");
        assert_eq!(
            address, &addr,
            "Single host resolver returned wrong address"
        );
    }
}
