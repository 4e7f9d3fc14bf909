//! Process-wide application context owning the registered pools.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tidepool_backend::Pool;
use tidepool_common::LifecycleError;

/// Explicit application context passed to lifecycle hooks and dependency
/// providers.
///
/// Pools are registered on startup under a configurable key and removed on
/// shutdown. The context is plain data handed around by the host; nothing
/// here is an ambient singleton.
#[derive(Default)]
pub struct AppContext {
    pools: RwLock<HashMap<String, Arc<dyn Pool>>>,
}

impl AppContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool under `key`. Fails when the key is already taken.
    pub fn insert_pool(&self, key: &str, pool: Arc<dyn Pool>) -> Result<(), LifecycleError> {
        let mut pools = self.pools.write().unwrap();
        if pools.contains_key(key) {
            return Err(LifecycleError::Configuration(format!(
                "a pool is already registered under '{key}'"
            )));
        }
        pools.insert(key.to_string(), pool);
        tracing::info!(pool_key = key, "Pool registered");
        Ok(())
    }

    /// Remove and return the pool registered under `key`, if any.
    pub fn remove_pool(&self, key: &str) -> Option<Arc<dyn Pool>> {
        self.pools.write().unwrap().remove(key)
    }

    /// Look up the pool registered under `key`.
    ///
    /// Fails when startup has not run, or shutdown already removed the
    /// pool.
    pub fn pool(&self, key: &str) -> Result<Arc<dyn Pool>, LifecycleError> {
        self.pools.read().unwrap().get(key).cloned().ok_or_else(|| {
            LifecycleError::Configuration(format!(
                "no pool registered under '{key}' (startup has not run)"
            ))
        })
    }
}
