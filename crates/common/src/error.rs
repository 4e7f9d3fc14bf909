//! Error taxonomy for pool and lifecycle operations.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the pool provider, session store and lifecycle
/// controller.
///
/// Nothing in this layer retries: acquire failures surface to the request
/// path, finalize failures never abort the release, and retry policy (if
/// any) belongs to the underlying pool.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Required configuration is missing or contradictory, or the pool was
    /// requested before startup ran.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The underlying pool failed to hand out a connection.
    #[error("failed to acquire connection: {0}")]
    Acquire(String),

    /// Commit or rollback failed while finalizing a lease.
    #[error("failed to finalize connection: {0}")]
    Finalize(String),

    /// The pool rejected a returned connection.
    #[error("failed to release connection: {0}")]
    Release(String),

    /// Returning a connection to the pool did not complete within the
    /// bounded wait. The lease is abandoned to the pool's own recovery.
    #[error("releasing connection timed out after {secs}s")]
    ReleaseTimeout { secs: f64 },
}

impl IntoResponse for LifecycleError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            LifecycleError::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            LifecycleError::Acquire(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            LifecycleError::Finalize(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            LifecycleError::Release(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            LifecycleError::ReleaseTimeout { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
