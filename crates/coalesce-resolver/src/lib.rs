//! # Request batching and coalescing
//!
//! This crate groups individual asks for a value into batches that are
//! executed together. A [`Batcher`] collects requests into per-key pending
//! sets, holds them for a resolver-configured delay window, and dispatches
//! each sealed batch to the [`Resolver`]'s `run_all`, which must complete
//! every entry exactly once.
//!
//! On top of the core protocol sit a few composable wrappers:
//!
//! - [`grouped`] batches only requests whose derived key is equal,
//! - [`tagged`] fans a tagged-union request type out to one handler per tag,
//! - [`cached`] deduplicates identical requests with a bounded in-memory
//!   cache (LRU or FIFO),
//! - [`persisted`] backs a resolver with an external [`RequestStore`],
//!   including stale-while-revalidate reads,
//! - [`race`] runs two resolvers against the same batch and takes the first
//!   to finish,
//! - [`batch_n`] and [`with_delay`] tune the batch formation policy.

#![warn(missing_docs)]

mod batcher;
mod cached;
mod combinators;
mod entry;
mod error;
mod persisted;
mod resolver;
mod store;

pub use batcher::Batcher;
pub use cached::{Strategy, cached};
pub use combinators::{batch_n, grouped, race, tagged, with_delay};
pub use entry::{BatchEntry, Completion, Request, RequestResult};
pub use error::{ResolverError, StoreError};
pub use persisted::persisted;
pub use resolver::{BatchKey, Resolver, from_function, make};
pub use store::{MemoryStore, RequestStore, StoredEntry};

#[cfg(test)]
mod tests;
