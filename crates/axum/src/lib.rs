//! Axum adapter for the tidepool connection lifecycle.
//!
//! [`plugin::DbLifecycle`] owns the pool across startup/shutdown,
//! [`layer::LifecycleLayer`] drives per-request leases from the outbound
//! half of each exchange, and the [`extract`] module provides the pool and
//! the scope's connection to handlers.

pub mod extract;
pub mod layer;
pub mod plugin;

pub use extract::{DbConnection, DbPool};
pub use layer::LifecycleLayer;
pub use plugin::DbLifecycle;
