//! Release policies driven by outbound lifecycle signals.
//!
//! Both policies implement the same hook, invoked once per outbound signal
//! per scope. [`PlainPolicy`] releases the lease on any terminus signal;
//! [`AutocommitPolicy`] additionally commits or rolls back based on the
//! response status before releasing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use tidepool_backend::{Connection, Pool, SharedConnection};
use tidepool_common::LifecycleError;
use tidepool_common::config::{CommitMode, DEFAULT_RELEASE_TIMEOUT_SECS};

use crate::scope::RequestScope;
use crate::signal::OutboundSignal;

/// Hook invoked once per outbound lifecycle signal per scope.
#[async_trait]
pub trait LifecyclePolicy: Send + Sync {
    async fn on_outbound_signal(
        &self,
        signal: OutboundSignal,
        scope: &RequestScope,
    ) -> Result<(), LifecycleError>;
}

/// Policy instance for the configured commit mode.
pub fn for_mode(mode: CommitMode, release_timeout: Duration) -> Arc<dyn LifecyclePolicy> {
    match mode {
        CommitMode::Plain => Arc::new(PlainPolicy::new(release_timeout)),
        CommitMode::Autocommit => Arc::new(AutocommitPolicy::new(release_timeout)),
    }
}

/// On any terminus signal, release the scope's connection untouched.
pub struct PlainPolicy {
    release_timeout: Duration,
}

impl PlainPolicy {
    pub fn new(release_timeout: Duration) -> Self {
        Self { release_timeout }
    }
}

impl Default for PlainPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs_f64(DEFAULT_RELEASE_TIMEOUT_SECS))
    }
}

#[async_trait]
impl LifecyclePolicy for PlainPolicy {
    async fn on_outbound_signal(
        &self,
        signal: OutboundSignal,
        scope: &RequestScope,
    ) -> Result<(), LifecycleError> {
        if !signal.is_terminus() {
            return Ok(());
        }
        let Some((pool, conn)) = scope.take_lease().await else {
            return Ok(());
        };
        ReleaseGuard::new(pool, conn, self.release_timeout, scope.id())
            .release()
            .await
    }
}

/// On the response-started signal, commit when the status is in
/// `[200, 300)` and roll back otherwise; release on any terminus signal.
///
/// Commit/rollback failures are logged and surfaced but never prevent the
/// release: the lease moves into a [`ReleaseGuard`] before finalization
/// runs.
pub struct AutocommitPolicy {
    release_timeout: Duration,
}

impl AutocommitPolicy {
    pub fn new(release_timeout: Duration) -> Self {
        Self { release_timeout }
    }
}

impl Default for AutocommitPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs_f64(DEFAULT_RELEASE_TIMEOUT_SECS))
    }
}

#[async_trait]
impl LifecyclePolicy for AutocommitPolicy {
    async fn on_outbound_signal(
        &self,
        signal: OutboundSignal,
        scope: &RequestScope,
    ) -> Result<(), LifecycleError> {
        if !signal.is_terminus() {
            return Ok(());
        }
        let Some((pool, conn)) = scope.take_lease().await else {
            return Ok(());
        };
        let mut guard = ReleaseGuard::new(pool, conn, self.release_timeout, scope.id());

        // Finalize first; the guard guarantees the release runs regardless.
        let finalized = match signal {
            OutboundSignal::ResponseStarted { status } => guard.finalize(status).await,
            _ => Ok(()),
        };
        if let Err(e) = &finalized {
            tracing::error!(
                scope_id = %scope.id(),
                error = %e,
                "Finalize failed; releasing connection anyway"
            );
        }

        guard.release().await?;
        finalized
    }
}

/// Scoped-resource guard carrying a taken lease to its release.
///
/// The lease lives inside the guard while commit/rollback runs;
/// [`release`](ReleaseGuard::release) performs a bounded hand-back. If the
/// guard is dropped first (signal handling cancelled mid-flight, or a panic
/// during finalization) the release is spawned onto the runtime so the
/// connection still goes home.
pub struct ReleaseGuard {
    lease: Option<(Arc<dyn Pool>, SharedConnection)>,
    release_timeout: Duration,
    scope_id: Uuid,
}

impl ReleaseGuard {
    pub fn new(
        pool: Arc<dyn Pool>,
        conn: SharedConnection,
        release_timeout: Duration,
        scope_id: Uuid,
    ) -> Self {
        Self {
            lease: Some((pool, conn)),
            release_timeout,
            scope_id,
        }
    }

    /// Commit when `status` is in `[200, 300)`, roll back otherwise.
    pub async fn finalize(&mut self, status: u16) -> Result<(), LifecycleError> {
        let Some((_, conn)) = &self.lease else {
            return Ok(());
        };
        let mut conn = conn.lock().await;
        if (200..300).contains(&status) {
            conn.commit().await
        } else {
            conn.rollback().await
        }
    }

    /// Return the connection to its pool, bounded by the release timeout.
    pub async fn release(mut self) -> Result<(), LifecycleError> {
        let Some((pool, conn)) = self.lease.take() else {
            return Ok(());
        };
        release_bounded(pool, conn, self.release_timeout, self.scope_id).await
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some((pool, conn)) = self.lease.take() else {
            return;
        };
        let wait = self.release_timeout;
        let scope_id = self.scope_id;

        // Signal handling was cancelled out from under us; the connection
        // still has to go home.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = release_bounded(pool, conn, wait, scope_id).await {
                        tracing::error!(
                            scope_id = %scope_id,
                            error = %e,
                            "Release after cancellation failed"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    scope_id = %scope_id,
                    "No runtime available to release connection; lease is lost"
                );
            }
        }
    }
}

/// Unwrap the shared handle and hand the connection back to the pool.
async fn release_bounded(
    pool: Arc<dyn Pool>,
    conn: SharedConnection,
    wait: Duration,
    scope_id: Uuid,
) -> Result<(), LifecycleError> {
    let conn = match Arc::try_unwrap(conn) {
        Ok(mutex) => mutex.into_inner(),
        Err(shared) => {
            // A handler smuggled its handle past the end of the exchange.
            // Dropping our clone lets the backend reclaim the connection
            // once the last holder goes away.
            tracing::warn!(
                scope_id = %scope_id,
                "Connection still shared at release; dropping the lease instead"
            );
            drop(shared);
            return Ok(());
        }
    };

    match tokio::time::timeout(wait, pool.release(conn)).await {
        Ok(result) => result,
        Err(_) => {
            let secs = wait.as_secs_f64();
            tracing::error!(
                scope_id = %scope_id,
                timeout_secs = secs,
                "Release timed out; lease abandoned to pool recovery"
            );
            Err(LifecycleError::ReleaseTimeout { secs })
        }
    }
}
