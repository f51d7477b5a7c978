//! The interface for identifying and connecting to backend services.

use crate::connection;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Other(e.into())
    }
}

/// The stable key identifying a backend within a service.
///
/// Backends are keyed by their rendered address, so a backend that moves
/// between ports is a distinct backend.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct Name(pub String);

impl Name {
    pub fn new(s: impl ToString) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A single instance of a service.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Backend {
    pub address: SocketAddr,
}

impl Backend {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }

    /// The key under which this backend is tracked: `address:port`.
    pub fn name(&self) -> Name {
        Name::new(self.address)
    }
}

/// Describes how a connection to a [Backend] should be constructed.
///
/// This is the sole contract the pool requires from the transport. The
/// resolution of [Connector::connect] plays the part of a "connected"
/// signal, and an `Err` the part of an "error" signal; per-attempt timeouts
/// are imposed by the caller. [Connector::is_valid] stands in for
/// spontaneous-close detection: the pool probes idle and recycled
/// connections with it, and a failure retires the connection.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: connection::Connection;

    /// Creates a connection to a backend.
    async fn connect(&self, backend: &Backend) -> Result<Self::Connection, Error>;

    /// Determines if the connection to a backend is still valid.
    async fn is_valid(&self, _conn: &mut Self::Connection) -> Result<(), Error> {
        Ok(())
    }
}

pub type SharedConnector<Conn> = Arc<dyn Connector<Connection = Conn>>;
