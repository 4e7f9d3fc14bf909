//! PostgreSQL backend built on `sqlx`.
//!
//! [`PgBackend`] adapts a [`sqlx::PgPool`] to the [`Pool`] capability set.
//! The pool is built from [`PoolSettings`]; connections are handed out as
//! [`PgLease`] values that expose the raw `sqlx` connection for queries.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Postgres};

use tidepool_common::config::PoolSettings;
use tidepool_common::error::LifecycleError;

use crate::{BoxConnection, Connection, Pool};

/// Future returned by a connect hook.
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), sqlx::Error>> + Send + 'a>>;

/// Programmatic hook run against a raw connection while the pool manages it.
pub type ConnectHook = Arc<dyn for<'a> Fn(&'a mut PgConnection) -> HookFuture<'a> + Send + Sync>;

/// Optional hooks wired into pool construction.
#[derive(Clone, Default)]
pub struct PgConnectHooks {
    /// Run once, right after a new connection is established.
    pub init: Option<ConnectHook>,
    /// Run every time a connection is about to be handed out.
    pub setup: Option<ConnectHook>,
}

impl PgConnectHooks {
    /// Hook set with only an init (after-connect) hook.
    pub fn on_init<F>(hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut PgConnection) -> HookFuture<'a> + Send + Sync + 'static,
    {
        Self {
            init: Some(Arc::new(hook)),
            setup: None,
        }
    }

    /// Hook set with only a setup (before-acquire) hook.
    pub fn on_setup<F>(hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut PgConnection) -> HookFuture<'a> + Send + Sync + 'static,
    {
        Self {
            init: None,
            setup: Some(Arc::new(hook)),
        }
    }
}

/// Connection pool backend for PostgreSQL.
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Build a pool from the given settings and connect to the database.
    pub async fn connect(settings: &PoolSettings) -> Result<Self, LifecycleError> {
        Self::connect_with_hooks(settings, PgConnectHooks::default()).await
    }

    /// Like [`PgBackend::connect`], with init/setup hooks installed.
    pub async fn connect_with_hooks(
        settings: &PoolSettings,
        hooks: PgConnectHooks,
    ) -> Result<Self, LifecycleError> {
        let mut connect_opts: PgConnectOptions = settings
            .dsn
            .parse()
            .map_err(|e| LifecycleError::Configuration(format!("invalid dsn: {e}")))?;

        if !settings.server_settings.is_empty() {
            connect_opts = connect_opts.options(
                settings
                    .server_settings
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            );
        }

        let mut pool_opts = PgPoolOptions::new().acquire_timeout(settings.acquire_timeout());

        if let Some(min) = settings.min_size {
            pool_opts = pool_opts.min_connections(min);
        }
        if let Some(max) = settings.max_size {
            pool_opts = pool_opts.max_connections(max);
        }
        match settings.max_inactive_lifetime_secs {
            // 0 disables idle reaping entirely.
            Some(secs) if secs > 0.0 => {
                pool_opts = pool_opts.idle_timeout(Duration::from_secs_f64(secs));
            }
            Some(_) => {
                pool_opts = pool_opts.idle_timeout(None);
            }
            None => {}
        }
        if settings.max_queries.is_some() {
            tracing::warn!(
                "max_queries is not supported by the sqlx backend; \
                 connections are recycled by lifetime instead"
            );
        }

        if let Some(init) = hooks.init {
            pool_opts = pool_opts.after_connect(move |conn, _meta| {
                let init = init.clone();
                Box::pin(async move { init(conn).await })
            });
        }
        if let Some(setup) = hooks.setup {
            pool_opts = pool_opts.before_acquire(move |conn, _meta| {
                let setup = setup.clone();
                Box::pin(async move {
                    setup(conn).await?;
                    Ok(true)
                })
            });
        }

        let pool = pool_opts
            .connect_with(connect_opts)
            .await
            .map_err(|e| LifecycleError::Configuration(format!("could not build pool: {e}")))?;

        tracing::info!(
            min_size = ?settings.min_size,
            max_size = ?settings.max_size,
            "Connected to PostgreSQL"
        );

        Ok(Self { pool })
    }

    /// Wrap an existing `sqlx` pool (the pre-built pool-instance case).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying `sqlx` pool.
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Pool for PgBackend {
    async fn acquire(&self) -> Result<BoxConnection, LifecycleError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| LifecycleError::Acquire(e.to_string()))?;
        Ok(Box::new(PgLease { conn }))
    }

    async fn release(&self, conn: BoxConnection) -> Result<(), LifecycleError> {
        // sqlx hands the connection back to the pool when the lease drops.
        drop(conn);
        Ok(())
    }

    async fn close(&self) -> Result<(), LifecycleError> {
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
        Ok(())
    }
}

/// A Postgres connection leased from a [`PgBackend`].
pub struct PgLease {
    conn: PoolConnection<Postgres>,
}

impl PgLease {
    /// The raw connection, for executing queries.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

#[async_trait]
impl Connection for PgLease {
    async fn commit(&mut self) -> Result<(), LifecycleError> {
        sqlx::query("COMMIT")
            .execute(&mut *self.conn)
            .await
            .map_err(|e| LifecycleError::Finalize(format!("commit failed: {e}")))?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), LifecycleError> {
        sqlx::query("ROLLBACK")
            .execute(&mut *self.conn)
            .await
            .map_err(|e| LifecycleError::Finalize(format!("rollback failed: {e}")))?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
