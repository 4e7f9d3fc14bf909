//! Axum extractors providing the pool and the scope's connection.

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;

use tidepool_backend::{Pool, SharedConnection};
use tidepool_common::LifecycleError;
use tidepool_common::config::DEFAULT_POOL_KEY;
use tidepool_lifecycle::context::AppContext;
use tidepool_lifecycle::scope::RequestScope;

/// Pool key for the current request, planted by the lifecycle layer so the
/// extractors resolve the same pool the layer releases to.
#[derive(Clone)]
pub(crate) struct ScopedPoolKey(pub(crate) Arc<str>);

fn pool_key(parts: &Parts) -> String {
    parts
        .extensions
        .get::<ScopedPoolKey>()
        .map(|key| key.0.to_string())
        .unwrap_or_else(|| DEFAULT_POOL_KEY.to_string())
}

/// The registered pool, looked up in the application context.
///
/// ```ignore
/// async fn handler(DbPool(pool): DbPool) -> impl IntoResponse { /* ... */ }
/// ```
#[derive(Clone)]
pub struct DbPool(pub Arc<dyn Pool>);

impl<S> FromRequestParts<S> for DbPool
where
    S: Send + Sync,
    Arc<AppContext>: FromRef<S>,
{
    type Rejection = LifecycleError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let ctx = Arc::<AppContext>::from_ref(state);
        Ok(DbPool(ctx.pool(&pool_key(parts))?))
    }
}

/// The request scope's leased connection, acquired on first use.
///
/// Repeated extraction within one request returns the same shared handle.
/// The lifecycle layer releases the lease when the exchange terminates;
/// handlers must not hold the handle past the response.
#[derive(Clone)]
pub struct DbConnection(pub SharedConnection);

impl<S> FromRequestParts<S> for DbConnection
where
    S: Send + Sync,
    Arc<AppContext>: FromRef<S>,
{
    type Rejection = LifecycleError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let scope = parts
            .extensions
            .get::<Arc<RequestScope>>()
            .cloned()
            .ok_or_else(|| {
                LifecycleError::Configuration(
                    "request scope missing (is the LifecycleLayer installed?)".to_string(),
                )
            })?;

        let ctx = Arc::<AppContext>::from_ref(state);
        let pool = ctx.pool(&pool_key(parts))?;
        let conn = scope.get_or_acquire(&pool).await?;
        Ok(DbConnection(conn))
    }
}
