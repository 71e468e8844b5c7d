use std::hash::Hash;

use coalesce_runtime::Deferred;

use crate::ResolverError;

/// A request type that can be resolved in batches.
///
/// Requests double as cache/dedup keys, hence the `Eq + Hash` requirement.
pub trait Request: Clone + Eq + Hash + Send + Sync + 'static {
    /// The success value this request resolves to.
    type Ok: Clone + Send + Sync + 'static;
    /// The domain error this request can fail with.
    type Err: Clone + Send + Sync + 'static;
}

/// The outcome of asking for a request's value.
pub type RequestResult<R> = Result<<R as Request>::Ok, ResolverError<<R as Request>::Err>>;

/// The single-assignment completion cell of one pending request.
///
/// The first completion wins; later attempts are ignored. Cloning yields
/// another handle onto the same cell, which is how latecomers are chained
/// onto an in-flight request.
pub struct Completion<R: Request> {
    cell: Deferred<RequestResult<R>>,
}

impl<R: Request> Clone for Completion<R> {
    fn clone(&self) -> Self {
        Completion {
            cell: self.cell.clone(),
        }
    }
}

impl<R: Request> Completion<R> {
    pub(crate) fn new() -> Self {
        Completion {
            cell: Deferred::new(),
        }
    }

    /// Completes the request with a success value.
    pub fn succeed(&self, value: R::Ok) -> bool {
        self.complete(Ok(value))
    }

    /// Completes the request with a domain error.
    pub fn fail(&self, error: R::Err) -> bool {
        self.complete(Err(ResolverError::Failed(error)))
    }

    /// Completes the request with a full result. Returns whether this call
    /// was the completing one.
    pub fn complete(&self, result: RequestResult<R>) -> bool {
        self.cell.complete(result)
    }

    /// Whether the request has been completed.
    pub fn is_complete(&self) -> bool {
        self.cell.is_complete()
    }

    /// Suspends until the request is completed.
    pub async fn wait(&self) -> RequestResult<R> {
        self.cell.wait().await
    }

    /// Non-blocking snapshot of the result, if completed.
    pub fn peek(&self) -> Option<RequestResult<R>> {
        self.cell.peek()
    }

    pub(crate) fn same_cell(&self, other: &Self) -> bool {
        self.cell.same_cell(&other.cell)
    }
}

/// One pending request inside a batch: the request value plus its
/// completion cell.
///
/// Clones share the completion, so the same batch can be submitted to two
/// resolvers (see [`race`](crate::race)) with first-write-wins semantics.
pub struct BatchEntry<R: Request> {
    request: R,
    completion: Completion<R>,
}

impl<R: Request> Clone for BatchEntry<R> {
    fn clone(&self) -> Self {
        BatchEntry {
            request: self.request.clone(),
            completion: self.completion.clone(),
        }
    }
}

impl<R: Request> BatchEntry<R> {
    pub(crate) fn new(request: R) -> Self {
        BatchEntry {
            request,
            completion: Completion::new(),
        }
    }

    /// The request value.
    pub fn request(&self) -> &R {
        &self.request
    }

    /// The completion cell for this request.
    pub fn completion(&self) -> &Completion<R> {
        &self.completion
    }

    /// Shorthand for completing with a success value.
    pub fn succeed(&self, value: R::Ok) -> bool {
        self.completion.succeed(value)
    }

    /// Shorthand for completing with a domain error.
    pub fn fail(&self, error: R::Err) -> bool {
        self.completion.fail(error)
    }
}
