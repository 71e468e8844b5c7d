//! Runtime primitives shared by the `coalesce` crates.
//!
//! These are the narrow contracts the cache and resolver layers are built on:
//!
//! - [`Deferred`], a single-assignment result cell with any number of
//!   awaiting readers. This is what makes request coalescing work: one task
//!   completes the cell, everybody else just waits on it.
//! - [`Scope`], a closeable finalizer registry that models the resource
//!   lifetime of a cached value. Closing a scope releases everything that was
//!   registered against it, exactly once.
//!
//! The module also re-exports an [`Instant`] type that is swapped for
//! [`tokio::time::Instant`] in test builds, so that expiry logic can be
//! driven deterministically with `tokio::time::{pause, advance}`.

#![warn(missing_docs)]

mod deferred;
mod scope;

pub use deferred::Deferred;
pub use scope::Scope;

pub use std::time::Duration;

#[cfg(any(test, feature = "test"))]
pub use tokio::time::Instant;

#[cfg(not(any(test, feature = "test")))]
pub use std::time::Instant;
