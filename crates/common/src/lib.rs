//! Shared configuration records and error types for the tidepool crates.

pub mod config;
pub mod error;

pub use config::{CommitMode, LifecycleConfig, PoolSettings};
pub use error::LifecycleError;
