//! The interface for objects which may be pooled.

/// A connection to a backend.
///
/// The pool never interprets the payload of a connection; it only moves it
/// between slots and claimants. Anything sendable qualifies. Teardown is
/// expressed through [Drop] — a slot owns its connection exclusively and
/// drops it exactly once.
pub trait Connection: Send + 'static {}

impl<T: Send + 'static> Connection for T {}
