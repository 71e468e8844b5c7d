use thiserror::Error;

/// The error surfaced by [`ScopedCache`](crate::ScopedCache) operations.
///
/// `Lookup` failures are stored in the entry exactly like successes, so
/// subsequent reads replay the same failure until the entry expires or is
/// invalidated. `Closed` is the interruption signal: the cache (or its
/// owning scope) was torn down, or an in-flight entry was evicted out from
/// under its waiters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError<E> {
    /// The cache was closed before or while the operation ran.
    #[error("cache closed")]
    Closed,
    /// The user-supplied lookup failed.
    #[error("lookup failed: {0}")]
    Lookup(E),
}

impl<E> CacheError<E> {
    /// Returns the lookup failure, if that is what this error is.
    pub fn into_lookup(self) -> Option<E> {
        match self {
            CacheError::Lookup(err) => Some(err),
            CacheError::Closed => None,
        }
    }
}
