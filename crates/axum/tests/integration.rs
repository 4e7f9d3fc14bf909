//! Integration tests for the axum adapter.
//!
//! Uses `tower::ServiceExt` to drive routes without a real HTTP server and
//! the stub backend instead of a database:
//!
//! ```bash
//! cargo test -p tidepool-axum --test integration
//! ```

use std::sync::Arc;

use axum::body::Body;
use axum::extract::FromRef;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use tower::ServiceExt;

use tidepool_axum::extract::DbConnection;
use tidepool_axum::plugin::DbLifecycle;
use tidepool_backend::Connection;
use tidepool_backend::stub::{StubBackend, StubConnection, StubOp};
use tidepool_common::LifecycleError;
use tidepool_common::config::{CommitMode, LifecycleConfig};
use tidepool_lifecycle::context::AppContext;

// ============================================================
// Helpers
// ============================================================

#[derive(Clone)]
struct TestState {
    ctx: Arc<AppContext>,
}

impl FromRef<TestState> for Arc<AppContext> {
    fn from_ref(state: &TestState) -> Self {
        state.ctx.clone()
    }
}

/// Handler that leases the scope's connection and reports its physical id.
async fn lease(DbConnection(conn): DbConnection) -> Json<serde_json::Value> {
    let mut conn = conn.lock().await;
    let stub = conn
        .as_any_mut()
        .downcast_mut::<StubConnection>()
        .expect("stub connection");
    Json(serde_json::json!({ "connection": stub.id() }))
}

/// Handler that leases a connection and then fails.
async fn fail(DbConnection(_conn): DbConnection) -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

/// Handler that never touches the pool.
async fn no_db() -> &'static str {
    "ok"
}

/// Build a router over a capacity-1 stub pool with the given commit mode.
async fn build_app(mode: CommitMode) -> (Arc<StubBackend>, Router, Arc<AppContext>, DbLifecycle) {
    let backend = StubBackend::new(1);
    let plugin =
        DbLifecycle::with_pool_instance(LifecycleConfig::default().with_mode(mode), backend.clone());

    let ctx = Arc::new(AppContext::new());
    plugin.on_startup(&ctx).await.unwrap();

    let app = Router::new()
        .route("/lease", get(lease))
        .route("/fail", get(fail))
        .route("/no-db", get(no_db))
        .layer(plugin.layer())
        .with_state(TestState { ctx: ctx.clone() });

    (backend, app, ctx, plugin)
}

async fn send(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

// ============================================================
// Startup / shutdown
// ============================================================

#[tokio::test]
async fn test_shutdown_without_startup_is_a_noop() {
    let plugin = DbLifecycle::with_pool_instance(LifecycleConfig::default(), StubBackend::new(1));
    let ctx = AppContext::new();

    plugin.on_shutdown(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_provide_pool_before_startup_fails() {
    let plugin = DbLifecycle::with_pool_instance(LifecycleConfig::default(), StubBackend::new(1));
    let ctx = AppContext::new();

    let err = plugin.provide_pool(&ctx).unwrap_err();
    assert!(matches!(err, LifecycleError::Configuration(_)));
}

#[tokio::test]
async fn test_create_pool_without_settings_or_instance_fails() {
    let plugin = DbLifecycle::new(LifecycleConfig::default());

    let err = plugin.create_pool().await.unwrap_err();
    assert!(matches!(err, LifecycleError::Configuration(_)));
}

#[tokio::test]
async fn test_startup_registers_and_shutdown_closes() {
    let backend = StubBackend::new(1);
    let plugin = DbLifecycle::with_pool_instance(LifecycleConfig::default(), backend.clone());
    let ctx = AppContext::new();

    plugin.on_startup(&ctx).await.unwrap();
    assert!(plugin.provide_pool(&ctx).is_ok());

    plugin.on_shutdown(&ctx).await.unwrap();
    assert!(backend.is_closed());
    assert!(plugin.provide_pool(&ctx).is_err());

    // Running shutdown again finds nothing to do.
    plugin.on_shutdown(&ctx).await.unwrap();
}

// ============================================================
// Request flow, plain mode
// ============================================================

#[tokio::test]
async fn test_lease_is_released_after_response() {
    let (backend, app, _ctx, _plugin) = build_app(CommitMode::Plain).await;

    let (status, json) = send(app, "/lease").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["connection"], 0);

    let log = backend.log();
    assert_eq!(log.acquires(), 1);
    assert_eq!(log.releases(), 1);
    assert_eq!(log.commits(), 0);
    assert_eq!(log.rollbacks(), 0);
}

#[tokio::test]
async fn test_handler_without_connection_touches_no_pool() {
    let (backend, app, _ctx, _plugin) = build_app(CommitMode::Plain).await;

    let (status, _json) = send(app, "/no-db").await;
    assert_eq!(status, StatusCode::OK);
    assert!(backend.log().ops().is_empty());
}

#[tokio::test]
async fn test_sequential_requests_reuse_the_physical_connection() {
    let (backend, app, _ctx, _plugin) = build_app(CommitMode::Plain).await;

    let (_, first) = send(app.clone(), "/lease").await;
    let (_, second) = send(app, "/lease").await;

    assert_eq!(first["connection"], 0);
    assert_eq!(second["connection"], 0);
    assert_eq!(backend.log().acquires(), 2);
    assert_eq!(backend.log().releases(), 2);
}

#[tokio::test]
async fn test_extractor_without_layer_is_rejected() {
    let backend = StubBackend::new(1);
    let plugin = DbLifecycle::with_pool_instance(LifecycleConfig::default(), backend.clone());
    let ctx = Arc::new(AppContext::new());
    plugin.on_startup(&ctx).await.unwrap();

    // No LifecycleLayer installed: the extractor must reject, not panic.
    let app = Router::new()
        .route("/lease", get(lease))
        .with_state(TestState { ctx });

    let (status, json) = send(app, "/lease").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(
        json["error"]
            .as_str()
            .unwrap()
            .contains("request scope missing")
    );
    assert!(backend.log().ops().is_empty());
}

// ============================================================
// Request flow, autocommit mode
// ============================================================

#[tokio::test]
async fn test_autocommit_commits_on_success_response() {
    let (backend, app, _ctx, _plugin) = build_app(CommitMode::Autocommit).await;

    let (status, _json) = send(app, "/lease").await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        backend.log().ops(),
        vec![StubOp::Acquire(0), StubOp::Commit(0), StubOp::Release(0)]
    );
}

#[tokio::test]
async fn test_autocommit_rolls_back_on_error_response() {
    let (backend, app, _ctx, _plugin) = build_app(CommitMode::Autocommit).await;

    let (status, _json) = send(app, "/fail").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    assert_eq!(
        backend.log().ops(),
        vec![StubOp::Acquire(0), StubOp::Rollback(0), StubOp::Release(0)]
    );
}

#[tokio::test]
async fn test_autocommit_failed_commit_still_releases() {
    let (backend, app, _ctx, _plugin) = build_app(CommitMode::Autocommit).await;
    backend.fail_commits();

    let (status, _json) = send(app, "/lease").await;
    // The handler already produced its response; the finalize failure is
    // logged by the layer, not surfaced to the client.
    assert_eq!(status, StatusCode::OK);

    assert_eq!(backend.log().commits(), 0);
    assert_eq!(backend.log().releases(), 1);
}
