use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use coalesce_runtime::Duration;

use crate::entry::{BatchEntry, Request};

/// The key a pending request is grouped under.
///
/// All entries handed to one `run_all` invocation share the same batch key.
/// Keys are opaque; wrappers that derive them (see
/// [`grouped`](crate::grouped)) memoize value-equal group keys onto the
/// same `BatchKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey(u64);

impl BatchKey {
    /// The key used when a resolver does not group: everything batches
    /// together.
    pub const SHARED: BatchKey = BatchKey(0);
}

/// Allocates fresh, collision-free batch keys for one deriving wrapper.
pub(crate) struct BatchKeyAllocator {
    next: AtomicU64,
}

impl BatchKeyAllocator {
    pub(crate) fn new() -> Self {
        BatchKeyAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn allocate(&self) -> BatchKey {
        BatchKey(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Executes batches of pending requests.
///
/// The contract: `run_all` receives a non-empty batch whose entries all
/// share a batch key, and must complete every entry's
/// [`Completion`](crate::Completion) exactly once, on success *and* on
/// failure. An entry left incomplete is a protocol violation; the
/// [`Batcher`](crate::Batcher) detects it after `run_all` returns and fails
/// the entry with [`ResolverError::Incomplete`](crate::ResolverError).
///
/// The remaining methods drive batch formation and are overridden by the
/// policy wrappers in this crate.
#[async_trait]
pub trait Resolver<R: Request>: Send + Sync + 'static {
    /// Executes one batch, completing every entry.
    async fn run_all(&self, batch: Vec<BatchEntry<R>>);

    /// Derives the batch key for a request. Defaults to one shared key.
    fn batch_key(&self, _request: &R) -> BatchKey {
        BatchKey::SHARED
    }

    /// How long a batch keeps collecting before it is sealed.
    ///
    /// Zero still coalesces: the flush runs on its own task, so everything
    /// submitted before that task gets scheduled joins the batch.
    fn delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Polled as requests accumulate; returning `false` seals the batch
    /// before the delay window elapses.
    fn collect_while(&self, _pending: &[R]) -> bool {
        true
    }

    /// Hook invoked before an entry joins a batch.
    ///
    /// Returning `None` means the resolver has already arranged for the
    /// entry's completion (immediately or later) and it must not enter the
    /// batch machinery; this is how the caching wrapper short-circuits
    /// duplicate requests.
    async fn pre_check(&self, entry: BatchEntry<R>) -> Option<BatchEntry<R>> {
        Some(entry)
    }
}

struct FromBatchFn<R, F> {
    run_all: F,
    _request: PhantomData<fn(&R)>,
}

#[async_trait]
impl<R, F, Fut> Resolver<R> for FromBatchFn<R, F>
where
    R: Request,
    F: Fn(Vec<BatchEntry<R>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run_all(&self, batch: Vec<BatchEntry<R>>) {
        (self.run_all)(batch).await;
    }
}

/// Creates a resolver from a batch-executing async function.
///
/// The function must complete every entry it is given.
pub fn make<R, F, Fut>(run_all: F) -> Arc<dyn Resolver<R>>
where
    R: Request,
    F: Fn(Vec<BatchEntry<R>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FromBatchFn {
        run_all,
        _request: PhantomData,
    })
}

struct FromFunction<R, F> {
    resolve: F,
    _request: PhantomData<fn(&R)>,
}

#[async_trait]
impl<R, F> Resolver<R> for FromFunction<R, F>
where
    R: Request,
    F: Fn(&R) -> Result<R::Ok, R::Err> + Send + Sync + 'static,
{
    async fn run_all(&self, batch: Vec<BatchEntry<R>>) {
        for entry in batch {
            match (self.resolve)(entry.request()) {
                Ok(value) => entry.succeed(value),
                Err(error) => entry.fail(error),
            };
        }
    }
}

/// Creates a resolver from a per-request function; batching still happens,
/// the function is simply applied to each member of the batch.
pub fn from_function<R, F>(resolve: F) -> Arc<dyn Resolver<R>>
where
    R: Request,
    F: Fn(&R) -> Result<R::Ok, R::Err> + Send + Sync + 'static,
{
    Arc::new(FromFunction {
        resolve,
        _request: PhantomData,
    })
}
