//! In-process stub backend for tests and local development.
//!
//! Models the observable pool contract (bounded capacity with
//! back-pressure, physical connection reuse, commit/rollback) without a
//! database, and records every operation so tests can assert on exact call
//! sequences.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use tidepool_common::LifecycleError;

use crate::{BoxConnection, Connection, Pool};

/// A single recorded backend operation. The payload is the physical
/// connection id, which survives release and re-acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubOp {
    Acquire(usize),
    Commit(usize),
    Rollback(usize),
    Release(usize),
    Close,
}

/// Operation log shared by a [`StubBackend`] and its connections.
#[derive(Debug, Default)]
pub struct StubLog {
    ops: std::sync::Mutex<Vec<StubOp>>,
}

impl StubLog {
    fn push(&self, op: StubOp) {
        self.ops.lock().unwrap().push(op);
    }

    /// All operations recorded so far, in order.
    pub fn ops(&self) -> Vec<StubOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn acquires(&self) -> usize {
        self.count(|op| matches!(op, StubOp::Acquire(_)))
    }

    pub fn releases(&self) -> usize {
        self.count(|op| matches!(op, StubOp::Release(_)))
    }

    pub fn commits(&self) -> usize {
        self.count(|op| matches!(op, StubOp::Commit(_)))
    }

    pub fn rollbacks(&self) -> usize {
        self.count(|op| matches!(op, StubOp::Rollback(_)))
    }

    fn count(&self, pred: impl Fn(&StubOp) -> bool) -> usize {
        self.ops.lock().unwrap().iter().filter(|op| pred(op)).count()
    }
}

#[derive(Debug, Default)]
struct StubShared {
    log: Arc<StubLog>,
    fail_commits: AtomicBool,
    release_delay: std::sync::Mutex<Option<Duration>>,
}

/// Semaphore-bounded stub pool.
pub struct StubBackend {
    permits: Arc<Semaphore>,
    free_ids: Mutex<Vec<usize>>,
    next_id: AtomicUsize,
    shared: Arc<StubShared>,
    closed: AtomicBool,
}

impl StubBackend {
    /// Stub pool holding at most `capacity` connections.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            free_ids: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            shared: Arc::new(StubShared::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Handle on the operation log, usable after the pool is boxed as
    /// `Arc<dyn Pool>`.
    pub fn log(&self) -> Arc<StubLog> {
        self.shared.log.clone()
    }

    /// Make every subsequent `commit` fail.
    pub fn fail_commits(&self) {
        self.shared.fail_commits.store(true, Ordering::SeqCst);
    }

    /// Delay every `release` by `delay`, for exercising bounded waits.
    pub fn delay_releases(&self, delay: Duration) {
        *self.shared.release_delay.lock().unwrap() = Some(delay);
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Pool for StubBackend {
    async fn acquire(&self) -> Result<BoxConnection, LifecycleError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LifecycleError::Acquire("stub pool is closed".to_string()))?;

        // Reuse a parked physical connection before minting a new one.
        let id = self
            .free_ids
            .lock()
            .await
            .pop()
            .unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::SeqCst));

        self.shared.log.push(StubOp::Acquire(id));
        Ok(Box::new(StubConnection {
            id,
            permit: Some(permit),
            shared: self.shared.clone(),
        }))
    }

    async fn release(&self, mut conn: BoxConnection) -> Result<(), LifecycleError> {
        let delay = *self.shared.release_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let stub = conn
            .as_any_mut()
            .downcast_mut::<StubConnection>()
            .ok_or_else(|| {
                LifecycleError::Release("foreign connection returned to stub pool".to_string())
            })?;

        let id = stub.id;
        let permit = stub.permit.take();
        // Park the id before freeing capacity so a waiting acquire sees it.
        self.free_ids.lock().await.push(id);
        self.shared.log.push(StubOp::Release(id));
        drop(permit);
        Ok(())
    }

    async fn close(&self) -> Result<(), LifecycleError> {
        self.closed.store(true, Ordering::SeqCst);
        self.permits.close();
        self.shared.log.push(StubOp::Close);
        Ok(())
    }
}

/// A connection leased from a [`StubBackend`].
pub struct StubConnection {
    id: usize,
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<StubShared>,
}

impl StubConnection {
    /// Physical connection id; stable across release and re-acquire.
    pub fn id(&self) -> usize {
        self.id
    }
}

#[async_trait]
impl Connection for StubConnection {
    async fn commit(&mut self) -> Result<(), LifecycleError> {
        if self.shared.fail_commits.load(Ordering::SeqCst) {
            return Err(LifecycleError::Finalize("stub commit failure".to_string()));
        }
        self.shared.log.push(StubOp::Commit(self.id));
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), LifecycleError> {
        self.shared.log.push(StubOp::Rollback(self.id));
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_id(conn: &mut BoxConnection) -> usize {
        conn.as_any_mut()
            .downcast_mut::<StubConnection>()
            .expect("stub connection")
            .id()
    }

    #[tokio::test]
    async fn test_release_parks_physical_connection_for_reuse() {
        let pool = StubBackend::new(1);

        let mut first = pool.acquire().await.unwrap();
        let first_id = conn_id(&mut first);
        pool.release(first).await.unwrap();

        let mut second = pool.acquire().await.unwrap();
        assert_eq!(conn_id(&mut second), first_id);
        assert_eq!(pool.log().acquires(), 2);
        assert_eq!(pool.log().releases(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_blocks_until_release() {
        let pool = StubBackend::new(1);
        let held = pool.acquire().await.unwrap();

        // Second acquire must not complete while the lease is out.
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(held).await.unwrap();
        let conn = waiter.await.unwrap();
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let pool = StubBackend::new(1);
        pool.close().await.unwrap();

        assert!(pool.is_closed());
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Acquire(_)));
    }

    #[tokio::test]
    async fn test_failing_commit_still_records_nothing() {
        let pool = StubBackend::new(1);
        pool.fail_commits();

        let mut conn = pool.acquire().await.unwrap();
        assert!(conn.commit().await.is_err());
        assert_eq!(pool.log().commits(), 0);
    }
}
