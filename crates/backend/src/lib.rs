//! Capability traits for connection pools and leased connections.
//!
//! The lifecycle crates only ever talk to these traits; concrete backends
//! adapt a real pool to them. [`postgres`] wraps `sqlx`, and the
//! feature-gated [`stub`] models the same contract in-process for tests.

pub mod postgres;
#[cfg(any(test, feature = "test-util"))]
pub mod stub;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use tidepool_common::LifecycleError;

/// A single backend session leased from a [`Pool`].
///
/// While leased, the connection is owned exclusively by one request scope;
/// it is never touched again after being released back to its pool.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Commit the connection's current transaction state.
    async fn commit(&mut self) -> Result<(), LifecycleError>;

    /// Roll back the connection's current transaction state.
    async fn rollback(&mut self) -> Result<(), LifecycleError>;

    /// Downcast seam. Handler code goes through this to reach the concrete
    /// lease (e.g. [`postgres::PgLease`]) for query execution.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Connection")
    }
}

/// A boxed connection trait object as handed out by a [`Pool`].
pub type BoxConnection = Box<dyn Connection>;

/// A leased connection shared between the request scope and handler code.
pub type SharedConnection = Arc<Mutex<BoxConnection>>;

/// A reusable set of backend connections with acquire/release semantics.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Check a connection out of the pool.
    ///
    /// Suspends while the pool is exhausted; this is the natural
    /// back-pressure point for request scopes.
    async fn acquire(&self) -> Result<BoxConnection, LifecycleError>;

    /// Return a previously acquired connection to the pool.
    async fn release(&self, conn: BoxConnection) -> Result<(), LifecycleError>;

    /// Close the pool. Waiting for in-flight leases to come home is
    /// delegated to the underlying implementation.
    async fn close(&self) -> Result<(), LifecycleError>;
}

impl std::fmt::Debug for dyn Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Pool")
    }
}
