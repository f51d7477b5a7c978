//! Connections which are borrowed from the connection pool.

use crate::connection::Connection;
use crate::slot::Returned;

use tokio::sync::mpsc::OwnedPermit;

/// An exclusive lease on one pooled connection.
///
/// The handle dereferences to the connection itself. Dropping the handle
/// releases the connection back to its slot in good standing; [Handle::fail]
/// releases it as broken, so the slot tears it down instead of reusing it.
///
/// The permit held here was reserved on the owning slot's private return
/// channel at claim time: the release cannot fail, cannot be duplicated,
/// and cannot reach any slot but the one the connection came from.
pub struct Handle<Conn: Connection> {
    conn: Option<Conn>,
    permit: Option<OwnedPermit<Returned<Conn>>>,
}

impl<Conn: Connection> Handle<Conn> {
    pub(crate) fn new(conn: Conn, permit: OwnedPermit<Returned<Conn>>) -> Self {
        Self {
            conn: Some(conn),
            permit: Some(permit),
        }
    }

    /// Returns the connection to the pool. Equivalent to dropping the
    /// handle.
    pub fn release(self) {}

    /// Returns the connection to the pool, marking it broken. The slot will
    /// destroy it rather than hand it to another claimant.
    pub fn fail(mut self) {
        self.put_back(false);
    }

    fn put_back(&mut self, ok: bool) {
        if let (Some(conn), Some(permit)) = (self.conn.take(), self.permit.take()) {
            permit.send(Returned { conn, ok });
        }
    }
}

impl<Conn: Connection> std::ops::Deref for Handle<Conn> {
    type Target = Conn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("claimed connection present until release")
    }
}

impl<Conn: Connection> std::ops::DerefMut for Handle<Conn> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("claimed connection present until release")
    }
}

impl<Conn: Connection> Drop for Handle<Conn> {
    fn drop(&mut self) {
        self.put_back(true);
    }
}
