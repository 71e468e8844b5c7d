use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use coalesce_runtime::Duration;
use futures::future::select;
use rustc_hash::FxHashMap;

use crate::entry::{BatchEntry, Request};
use crate::resolver::{BatchKey, BatchKeyAllocator, Resolver};

struct Grouped<R: Request, G, F> {
    inner: Arc<dyn Resolver<R>>,
    key_fn: F,
    keys: Mutex<FxHashMap<G, BatchKey>>,
    allocator: BatchKeyAllocator,
}

#[async_trait]
impl<R, G, F> Resolver<R> for Grouped<R, G, F>
where
    R: Request,
    G: Eq + Hash + Send + Sync + 'static,
    F: Fn(&R) -> G + Send + Sync + 'static,
{
    async fn run_all(&self, batch: Vec<BatchEntry<R>>) {
        self.inner.run_all(batch).await;
    }

    fn batch_key(&self, request: &R) -> BatchKey {
        let group = (self.key_fn)(request);
        let mut keys = self.keys.lock().unwrap();
        *keys
            .entry(group)
            .or_insert_with(|| self.allocator.allocate())
    }

    fn delay(&self) -> Duration {
        self.inner.delay()
    }

    fn collect_while(&self, pending: &[R]) -> bool {
        self.inner.collect_while(pending)
    }

    async fn pre_check(&self, entry: BatchEntry<R>) -> Option<BatchEntry<R>> {
        self.inner.pre_check(entry).await
    }
}

/// Restricts batching to requests with an equal derived key.
///
/// Value-equal keys are memoized onto the same [`BatchKey`], so two
/// requests share a batch exactly when `key_fn` maps them to equal values.
pub fn grouped<R, G, F>(resolver: Arc<dyn Resolver<R>>, key_fn: F) -> Arc<dyn Resolver<R>>
where
    R: Request,
    G: Eq + Hash + Send + Sync + 'static,
    F: Fn(&R) -> G + Send + Sync + 'static,
{
    Arc::new(Grouped {
        inner: resolver,
        key_fn,
        keys: Mutex::new(FxHashMap::default()),
        allocator: BatchKeyAllocator::new(),
    })
}

struct Tagged<R, T, F> {
    tag_fn: T,
    run_tag: F,
    keys: Mutex<FxHashMap<&'static str, BatchKey>>,
    allocator: BatchKeyAllocator,
    _request: PhantomData<fn(&R)>,
}

#[async_trait]
impl<R, T, F, Fut> Resolver<R> for Tagged<R, T, F>
where
    R: Request,
    T: Fn(&R) -> &'static str + Send + Sync + 'static,
    F: Fn(&'static str, Vec<R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<R::Ok>, R::Err>> + Send + 'static,
{
    async fn run_all(&self, batch: Vec<BatchEntry<R>>) {
        // Grouping by tag happened at batch formation; every entry here
        // shares the first entry's tag.
        let Some(first) = batch.first() else { return };
        let tag = (self.tag_fn)(first.request());
        let requests: Vec<R> = batch
            .iter()
            .map(|entry| entry.request().clone())
            .collect();

        match (self.run_tag)(tag, requests).await {
            Ok(values) => {
                if values.len() != batch.len() {
                    tracing::error!(
                        tag,
                        expected = batch.len(),
                        got = values.len(),
                        "tag handler returned a mismatched number of results"
                    );
                }
                for (entry, value) in batch.iter().zip(values) {
                    entry.succeed(value);
                }
            }
            Err(error) => {
                for entry in &batch {
                    entry.fail(error.clone());
                }
            }
        }
    }

    fn batch_key(&self, request: &R) -> BatchKey {
        let tag = (self.tag_fn)(request);
        let mut keys = self.keys.lock().unwrap();
        *keys.entry(tag).or_insert_with(|| self.allocator.allocate())
    }
}

/// A resolver for tagged-union request types: requests are grouped by tag,
/// and each group is resolved by one `run_tag(tag, requests)` call whose
/// results fan back out positionally.
///
/// A tag-level failure fails every entry of that tag's group with the same
/// error.
pub fn tagged<R, T, F, Fut>(tag_fn: T, run_tag: F) -> Arc<dyn Resolver<R>>
where
    R: Request,
    T: Fn(&R) -> &'static str + Send + Sync + 'static,
    F: Fn(&'static str, Vec<R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<R::Ok>, R::Err>> + Send + 'static,
{
    Arc::new(Tagged {
        tag_fn,
        run_tag,
        keys: Mutex::new(FxHashMap::default()),
        allocator: BatchKeyAllocator::new(),
        _request: PhantomData,
    })
}

struct Race<R: Request> {
    a: Arc<dyn Resolver<R>>,
    b: Arc<dyn Resolver<R>>,
}

#[async_trait]
impl<R: Request> Resolver<R> for Race<R> {
    async fn run_all(&self, batch: Vec<BatchEntry<R>>) {
        let mirror = batch.clone();
        // First resolver to return wins; the loser's future is dropped.
        // Entries complete once, so overlapping completions are benign.
        let _ = select(self.a.run_all(batch), self.b.run_all(mirror)).await;
    }

    fn batch_key(&self, request: &R) -> BatchKey {
        self.a.batch_key(request)
    }

    fn delay(&self) -> Duration {
        self.a.delay()
    }

    fn collect_while(&self, pending: &[R]) -> bool {
        self.a.collect_while(pending)
    }

    async fn pre_check(&self, entry: BatchEntry<R>) -> Option<BatchEntry<R>> {
        self.a.pre_check(entry).await
    }
}

/// Runs every batch against both resolvers concurrently and takes the first
/// to finish, cancelling the other. Batch formation policy comes from `a`.
pub fn race<R: Request>(a: Arc<dyn Resolver<R>>, b: Arc<dyn Resolver<R>>) -> Arc<dyn Resolver<R>> {
    Arc::new(Race { a, b })
}

struct BatchN<R: Request> {
    inner: Arc<dyn Resolver<R>>,
    max: usize,
}

#[async_trait]
impl<R: Request> Resolver<R> for BatchN<R> {
    async fn run_all(&self, batch: Vec<BatchEntry<R>>) {
        self.inner.run_all(batch).await;
    }

    fn batch_key(&self, request: &R) -> BatchKey {
        self.inner.batch_key(request)
    }

    fn delay(&self) -> Duration {
        self.inner.delay()
    }

    fn collect_while(&self, pending: &[R]) -> bool {
        pending.len() < self.max && self.inner.collect_while(pending)
    }

    async fn pre_check(&self, entry: BatchEntry<R>) -> Option<BatchEntry<R>> {
        self.inner.pre_check(entry).await
    }
}

/// Seals a batch as soon as it holds `max` requests, without waiting for
/// the delay window.
pub fn batch_n<R: Request>(resolver: Arc<dyn Resolver<R>>, max: usize) -> Arc<dyn Resolver<R>> {
    Arc::new(BatchN {
        inner: resolver,
        max,
    })
}

struct WithDelay<R: Request> {
    inner: Arc<dyn Resolver<R>>,
    delay: Duration,
}

#[async_trait]
impl<R: Request> Resolver<R> for WithDelay<R> {
    async fn run_all(&self, batch: Vec<BatchEntry<R>>) {
        self.inner.run_all(batch).await;
    }

    fn batch_key(&self, request: &R) -> BatchKey {
        self.inner.batch_key(request)
    }

    fn delay(&self) -> Duration {
        self.delay
    }

    fn collect_while(&self, pending: &[R]) -> bool {
        self.inner.collect_while(pending)
    }

    async fn pre_check(&self, entry: BatchEntry<R>) -> Option<BatchEntry<R>> {
        self.inner.pre_check(entry).await
    }
}

/// Overrides the batch collection window of `resolver`.
pub fn with_delay<R: Request>(resolver: Arc<dyn Resolver<R>>, delay: Duration) -> Arc<dyn Resolver<R>> {
    Arc::new(WithDelay {
        inner: resolver,
        delay,
    })
}
