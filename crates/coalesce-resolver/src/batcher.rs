use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::entry::{BatchEntry, Request, RequestResult};
use crate::error::ResolverError;
use crate::resolver::{BatchKey, Resolver};

/// A batch that is still collecting requests.
///
/// The epoch ties a pending set to the flusher task that was spawned for
/// it: when a batch is sealed early, a later flusher for the same key must
/// not flush its successor prematurely.
struct PendingBatch<R: Request> {
    epoch: u64,
    entries: Vec<BatchEntry<R>>,
}

struct BatcherInner<R: Request> {
    resolver: Arc<dyn Resolver<R>>,
    pending: Mutex<FxHashMap<BatchKey, PendingBatch<R>>>,
    epochs: AtomicU64,
}

/// Collects individual asks into per-key batches and dispatches them to a
/// [`Resolver`].
///
/// The first request for a batch key spawns a flusher task that seals the
/// batch once the resolver's delay window elapses; each arriving request
/// re-evaluates `collect_while` and can seal the batch early. Clones share
/// the same pending state.
pub struct Batcher<R: Request> {
    inner: Arc<BatcherInner<R>>,
}

impl<R: Request> Clone for Batcher<R> {
    fn clone(&self) -> Self {
        Batcher {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Request> Batcher<R> {
    /// Creates a batcher dispatching to `resolver`.
    pub fn new(resolver: Arc<dyn Resolver<R>>) -> Self {
        Batcher {
            inner: Arc::new(BatcherInner {
                resolver,
                pending: Mutex::new(FxHashMap::default()),
                epochs: AtomicU64::new(0),
            }),
        }
    }

    /// Asks for the value of `request`, joining the pending batch for its
    /// key (or starting one) and awaiting completion.
    pub async fn ask(&self, request: R) -> RequestResult<R> {
        let entry = BatchEntry::new(request.clone());
        let completion = entry.completion().clone();

        // The resolver may short-circuit the entry entirely (dedup, cache
        // hits); it then owns the completion.
        let Some(entry) = self.inner.resolver.pre_check(entry).await else {
            return completion.wait().await;
        };

        let key = self.inner.resolver.batch_key(&request);
        let seal_now = {
            let mut pending = self.inner.pending.lock().unwrap();
            let batch = pending.entry(key).or_insert_with(|| {
                let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed);
                spawn_flusher(Arc::clone(&self.inner), key, epoch);
                PendingBatch {
                    epoch,
                    entries: Vec::new(),
                }
            });
            batch.entries.push(entry);
            let requests: Vec<R> = batch
                .entries
                .iter()
                .map(|entry| entry.request().clone())
                .collect();
            !self.inner.resolver.collect_while(&requests)
        };

        if seal_now {
            flush(&self.inner, key, None).await;
        }
        completion.wait().await
    }
}

/// Waits out the delay window, then flushes the batch it was spawned for.
fn spawn_flusher<R: Request>(inner: Arc<BatcherInner<R>>, key: BatchKey, epoch: u64) {
    tokio::spawn(async move {
        let delay = inner.resolver.delay();
        tokio::time::sleep(delay).await;
        flush(&inner, key, Some(epoch)).await;
    });
}

/// Seals and dispatches the pending batch for `key`.
///
/// With `epoch` given, only the batch that epoch was spawned for is
/// flushed; early seals pass `None` and take whatever is pending.
async fn flush<R: Request>(inner: &Arc<BatcherInner<R>>, key: BatchKey, epoch: Option<u64>) {
    let batch = {
        let mut pending = inner.pending.lock().unwrap();
        let sealable = pending
            .get(&key)
            .is_some_and(|batch| epoch.is_none_or(|epoch| epoch == batch.epoch));
        if sealable { pending.remove(&key) } else { None }
    };
    let Some(batch) = batch else { return };
    if batch.entries.is_empty() {
        return;
    }

    let completions: Vec<_> = batch
        .entries
        .iter()
        .map(|entry| entry.completion().clone())
        .collect();

    inner.resolver.run_all(batch.entries).await;

    for completion in completions {
        if !completion.is_complete() {
            tracing::error!("resolver returned without completing every entry in its batch");
            completion.complete(Err(ResolverError::Incomplete));
        }
    }
}
