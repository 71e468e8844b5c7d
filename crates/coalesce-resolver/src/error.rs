use thiserror::Error;

/// The error surfaced when asking a resolver for a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolverError<E> {
    /// The resolver failed this request with a domain error.
    #[error("request failed: {0}")]
    Failed(E),
    /// Protocol violation: `run_all` returned without completing this
    /// request's entry.
    #[error("resolver returned without completing the request")]
    Incomplete,
    /// The backing request store failed.
    #[error("request store error: {0}")]
    Store(StoreError),
}

/// An opaque error from a [`RequestStore`](crate::RequestStore)
/// implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    /// Creates a store error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        StoreError {
            message: message.into(),
        }
    }
}
