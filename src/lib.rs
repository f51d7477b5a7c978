//! tether is a connection pooling crate.
//!
//! tether manages a population of connections to a service addressed by
//! logical name, handing them out on demand, absorbing backend failure and
//! recovery, and smoothing bursts in demand.
//!
//! It uses the following terminology:
//! * Services are named entities providing the same interface.
//! * Backends are specific instantiations of a program, providing
//!   a service. In the case of, e.g., a distributed database, a single
//!   service would be provided by multiple backends.
//! * Slots are the pool's ongoing intents to each hold one connection to
//!   one backend; the rebalancer decides how many slots each backend gets.
//! * Claims are exclusive leases on one ready connection, returned to the
//!   pool when dropped.
//!
//! # Usage
//!
//! * The main interface for this crate is [pool::Pool].
//! * To construct a pool, you must supply a [resolver::Resolver] and
//!   a [backend::Connector]. These are interfaces which specify "how to find
//!   backends" and "how to create connections to a backend", respectively.
//! * [policy::Policy] sizes the pool and configures claim timeouts, retry
//!   budgets ([recovery::Recovery]), and overload shedding.
//!
//! # Failure handling
//!
//! A backend whose connections exhaust their retry budget is marked dead:
//! its remaining slots drain, its share of the pool shifts to the surviving
//! backends, and a single monitor slot keeps probing it with infinite
//! retries. When the monitor gets through, the backend rejoins the rotation.
//! If every backend is dead the pool fails fast, shedding its queue, until
//! a monitor succeeds.
//!
//! # Overload behavior
//!
//! The pool can run a controlled-delay (CoDel) controller over its claim
//! queue ([policy::OverloadPolicy]): when even the best-served claims spend
//! too long queued, stale claims are shed with an error rather than served
//! arbitrarily late, and idle-connection lifetimes tighten to reclaim
//! capacity.

// Public API
pub mod backend;
pub mod claim;
pub mod connection;
pub mod policy;
pub mod pool;
pub mod recovery;
pub mod resolver;
pub mod service;

// Necessary for implementation
mod backoff;
mod codel;
mod rebalancer;
mod slot;
mod socket;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod connectors;
pub mod resolvers;
