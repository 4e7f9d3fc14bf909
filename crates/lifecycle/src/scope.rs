//! Request scope and scoped session store.

use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use tidepool_backend::{Pool, SharedConnection};
use tidepool_common::LifecycleError;

/// Lease state of a request scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LeaseState {
    /// No connection has been acquired for this scope.
    #[default]
    NoConnection,
    /// A connection is leased and stored in the scope.
    Leased,
    /// The lease has been taken for release. Terminal.
    Released,
}

#[derive(Default)]
struct SessionSlot {
    conn: Option<SharedConnection>,
    pool: Option<Arc<dyn Pool>>,
    state: LeaseState,
}

/// The lifetime container for one request/response or streaming exchange.
///
/// Holds at most one leased connection together with a reference to the
/// pool that owns it (release needs both). All access goes through an
/// internal mutex; holding that mutex across the acquire await is what
/// keeps concurrent [`get_or_acquire`](RequestScope::get_or_acquire) calls
/// within one scope from double-acquiring.
pub struct RequestScope {
    id: Uuid,
    slot: Mutex<SessionSlot>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            slot: Mutex::new(SessionSlot::default()),
        }
    }

    /// Identity of this scope, threaded through log fields.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lease state.
    pub async fn state(&self) -> LeaseState {
        self.slot.lock().await.state
    }

    /// Return the scope's connection, acquiring one on first use.
    ///
    /// Idempotent: a second call returns the same shared handle without
    /// touching the pool. Suspends while the pool is exhausted.
    pub async fn get_or_acquire(
        &self,
        pool: &Arc<dyn Pool>,
    ) -> Result<SharedConnection, LifecycleError> {
        let mut slot = self.slot.lock().await;

        if let Some(conn) = &slot.conn {
            return Ok(conn.clone());
        }
        if slot.state == LeaseState::Released {
            return Err(LifecycleError::Configuration(format!(
                "scope {} already released its connection",
                self.id
            )));
        }

        let conn = pool.acquire().await?;
        tracing::debug!(scope_id = %self.id, "Connection leased");

        let shared: SharedConnection = Arc::new(Mutex::new(conn));
        slot.conn = Some(shared.clone());
        slot.pool = Some(pool.clone());
        slot.state = LeaseState::Leased;
        Ok(shared)
    }

    /// Take the lease out of the scope for release.
    ///
    /// Returns `None` when nothing was ever acquired or the lease was
    /// already taken; callers treat that as a no-op. The scope never hands
    /// the same lease out twice.
    pub async fn take_lease(&self) -> Option<(Arc<dyn Pool>, SharedConnection)> {
        let mut slot = self.slot.lock().await;
        let conn = slot.conn.take()?;
        let pool = slot.pool.take()?;
        slot.state = LeaseState::Released;
        Some((pool, conn))
    }
}

impl Default for RequestScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_backend::stub::StubBackend;

    #[tokio::test]
    async fn test_state_transitions() {
        let pool: Arc<dyn Pool> = StubBackend::new(1);
        let scope = RequestScope::new();
        assert_eq!(scope.state().await, LeaseState::NoConnection);

        scope.get_or_acquire(&pool).await.unwrap();
        assert_eq!(scope.state().await, LeaseState::Leased);

        assert!(scope.take_lease().await.is_some());
        assert_eq!(scope.state().await, LeaseState::Released);
        assert!(scope.take_lease().await.is_none());
    }

    #[tokio::test]
    async fn test_acquire_after_release_is_an_error() {
        let pool: Arc<dyn Pool> = StubBackend::new(1);
        let scope = RequestScope::new();

        scope.get_or_acquire(&pool).await.unwrap();
        scope.take_lease().await.unwrap();

        let err = scope.get_or_acquire(&pool).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Configuration(_)));
    }
}
