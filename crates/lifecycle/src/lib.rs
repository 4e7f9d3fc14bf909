//! Per-request connection lifecycle.
//!
//! A [`RequestScope`] leases at most one connection from a registered pool;
//! a [`LifecyclePolicy`] observes the outbound half of the exchange and
//! guarantees the lease is released exactly once, however the exchange
//! terminates.

pub mod context;
pub mod policy;
pub mod scope;
pub mod signal;

pub use context::AppContext;
pub use policy::{AutocommitPolicy, LifecyclePolicy, PlainPolicy, ReleaseGuard};
pub use scope::{LeaseState, RequestScope};
pub use signal::OutboundSignal;
