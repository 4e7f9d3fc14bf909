//! Tidepool demo server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::FromRef;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use tidepool_axum::extract::DbConnection;
use tidepool_axum::plugin::DbLifecycle;
use tidepool_backend::Connection;
use tidepool_backend::postgres::PgLease;
use tidepool_common::config::LifecycleConfig;
use tidepool_lifecycle::context::AppContext;

#[derive(Clone)]
struct AppState {
    ctx: Arc<AppContext>,
}

impl FromRef<AppState> for Arc<AppContext> {
    fn from_ref(state: &AppState) -> Self {
        state.ctx.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("tidepool_axum=debug,tidepool_lifecycle=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting tidepool demo server...");

    // Load configuration and build the plugin
    let config = LifecycleConfig::from_env()?;
    let plugin = DbLifecycle::new(config);

    // Create the pool and register it in the application context
    let ctx = Arc::new(AppContext::new());
    plugin.on_startup(&ctx).await?;

    // Build router
    let state = AppState { ctx: ctx.clone() };
    let app = Router::new()
        .route("/health", get(health))
        .route("/db/now", get(db_now))
        .layer(plugin.layer())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    tracing::info!("Demo server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Tear the pool down once the server has drained
    plugin.on_shutdown(&ctx).await?;
    tracing::info!("Demo server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("Failed to listen for shutdown signal");
    }
}

/// Liveness probe; does not touch the pool.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tidepool-demo",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Round-trip through the scope's leased connection.
async fn db_now(
    DbConnection(conn): DbConnection,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let mut conn = conn.lock().await;
    let lease = conn.as_any_mut().downcast_mut::<PgLease>().ok_or((
        StatusCode::INTERNAL_SERVER_ERROR,
        "postgres backend expected".to_string(),
    ))?;

    let row: (String,) = sqlx::query_as("SELECT now()::text")
        .fetch_one(&mut *lease.connection())
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("DB error: {}", e),
            )
        })?;

    Ok(Json(serde_json::json!({ "now": row.0 })))
}
