//! # A scoped, capacity-bounded, expiring cache
//!
//! [`ScopedCache`] is an in-memory map from keys to asynchronously computed
//! values, with a few properties that the usual memoization map does not
//! have:
//!
//! - **Request coalescing**: concurrent lookups for the same key collapse
//!   into a single invocation of the user-supplied lookup function. All
//!   callers await the same [`Deferred`](coalesce_runtime::Deferred) cell,
//!   and cancelling one caller never cancels the shared computation.
//! - **Resource-scoped values**: every entry owns a fresh
//!   [`Scope`](coalesce_runtime::Scope). Resources the lookup acquires are
//!   registered against it and are released exactly once, when the entry is
//!   evicted, invalidated, replaced, or the whole cache is torn down.
//! - **Per-result expiry**: the time-to-live is computed from the finished
//!   lookup result, so failures can be given a zero TTL ("don't cache
//!   failures") while successes live forever, or anything in between.
//! - **Bounded capacity with LRU eviction**: iteration order of the backing
//!   map is insertion/touch order; read hits promote their entry, and on
//!   overflow the oldest entries are evicted and their scopes closed.
//!
//! Failures of the lookup are cached and replayed just like successes,
//! subject to the same TTL policy; see [`CacheError`].

#![warn(missing_docs)]

mod error;
mod scoped;

pub use error::CacheError;
pub use scoped::{CacheStats, ScopedCache};
