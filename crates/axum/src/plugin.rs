//! Plugin wiring: pool construction, startup/shutdown hooks and the layer.

use std::sync::{Arc, Mutex};

use tidepool_backend::postgres::{PgBackend, PgConnectHooks};
use tidepool_backend::{Pool, SharedConnection};
use tidepool_common::LifecycleError;
use tidepool_common::config::LifecycleConfig;
use tidepool_lifecycle::context::AppContext;
use tidepool_lifecycle::policy;
use tidepool_lifecycle::scope::RequestScope;

use crate::layer::LifecycleLayer;

/// Database lifecycle plugin for an axum application.
///
/// Carries the configuration, builds the pool on startup, tears it down on
/// shutdown and hands out the layer that drives per-request leases.
pub struct DbLifecycle {
    config: LifecycleConfig,
    pool_instance: Mutex<Option<Arc<dyn Pool>>>,
    hooks: PgConnectHooks,
}

impl DbLifecycle {
    /// Plugin that builds its pool from the configured settings.
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            pool_instance: Mutex::new(None),
            hooks: PgConnectHooks::default(),
        }
    }

    /// Plugin that reuses a pre-built pool instead of building one.
    pub fn with_pool_instance(config: LifecycleConfig, pool: Arc<dyn Pool>) -> Self {
        Self {
            config,
            pool_instance: Mutex::new(Some(pool)),
            hooks: PgConnectHooks::default(),
        }
    }

    /// Install Postgres connect hooks, used when the pool is built here.
    pub fn with_connect_hooks(mut self, hooks: PgConnectHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Return the pool, building it on first use.
    ///
    /// Fails with a configuration error when neither pool settings nor a
    /// pool instance were provided.
    pub async fn create_pool(&self) -> Result<Arc<dyn Pool>, LifecycleError> {
        if let Some(pool) = self.pool_instance.lock().unwrap().clone() {
            return Ok(pool);
        }

        let Some(settings) = &self.config.pool else {
            return Err(LifecycleError::Configuration(
                "one of pool settings or a pool instance must be provided".to_string(),
            ));
        };

        let backend = PgBackend::connect_with_hooks(settings, self.hooks.clone()).await?;
        let pool: Arc<dyn Pool> = Arc::new(backend);
        *self.pool_instance.lock().unwrap() = Some(pool.clone());
        Ok(pool)
    }

    /// Create the pool and register it in the application context.
    pub async fn on_startup(&self, ctx: &AppContext) -> Result<(), LifecycleError> {
        let pool = self.create_pool().await?;
        ctx.insert_pool(&self.config.pool_key, pool)
    }

    /// Remove the pool from the context and close it.
    ///
    /// A no-op when no pool was ever registered, so shutdown is safe to run
    /// unconditionally.
    pub async fn on_shutdown(&self, ctx: &AppContext) -> Result<(), LifecycleError> {
        let Some(pool) = ctx.remove_pool(&self.config.pool_key) else {
            return Ok(());
        };
        tracing::info!(pool_key = %self.config.pool_key, "Closing pool");
        pool.close().await
    }

    /// Look up the registered pool.
    pub fn provide_pool(&self, ctx: &AppContext) -> Result<Arc<dyn Pool>, LifecycleError> {
        ctx.pool(&self.config.pool_key)
    }

    /// Return the scope's connection, acquiring one on first use.
    pub async fn provide_connection(
        &self,
        ctx: &AppContext,
        scope: &RequestScope,
    ) -> Result<SharedConnection, LifecycleError> {
        let pool = self.provide_pool(ctx)?;
        scope.get_or_acquire(&pool).await
    }

    /// Layer delivering the outbound signals for the configured mode.
    pub fn layer(&self) -> LifecycleLayer {
        let policy = policy::for_mode(self.config.mode, self.config.release_timeout());
        LifecycleLayer::new(policy).with_pool_key(&self.config.pool_key)
    }
}
