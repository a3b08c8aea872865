//! Named advisory locks for Meridian control workers.
//!
//! Every controller tick serialises work on one item by taking a lock named
//! after it. Acquisition never waits: [`LockBackend::try_acquire`] returns
//! `Ok(None)` straight away when someone else holds the name, and callers
//! treat that as expected contention.
//!
//! Holding a lock is represented by a [`LockGuard`]. Releasing it explicitly
//! with [`LockGuard::release`] is preferred; a guard dropped on any other exit
//! path (early return, error, panic unwinding) still releases the lock from a
//! spawned task.
//!
//! Two backends are provided:
//!
//! - [`MemoryLock`] (feature `memory`) for single-process deployments and tests
//! - [`PostgresLock`] (feature `postgres`) built on session-level
//!   `pg_try_advisory_lock`, so a crashed worker's locks vanish with its
//!   database session

#![forbid(unsafe_code)]

mod error;
mod traits;
mod types;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "config")]
mod config;

#[cfg(feature = "config")]
mod provider;

pub use error::{LockError, StateError};
pub use traits::{LockBackend, LockOps};
pub use types::LockGuard;

#[cfg(feature = "memory")]
pub use memory::MemoryLock;

#[cfg(feature = "postgres")]
pub use postgres::PostgresLock;

#[cfg(feature = "config")]
pub use config::LockConfig;

#[cfg(feature = "config")]
pub use provider::lock_backend_from_config;
