use std::sync::Arc;

use async_trait::async_trait;
use coalesce_runtime::{Duration, Instant};

use crate::entry::{BatchEntry, Completion, Request};
use crate::error::ResolverError;
use crate::resolver::{BatchKey, Resolver};
use crate::store::RequestStore;

enum Freshness {
    Fresh,
    Stale,
    Expired,
}

struct Persisted<R: Request> {
    inner: Arc<dyn Resolver<R>>,
    store: Arc<dyn RequestStore<R>>,
    time_to_live: Option<Duration>,
    stale_while_revalidate: Option<Duration>,
}

impl<R: Request> Persisted<R> {
    fn freshness(&self, stored_at: Instant, now: Instant) -> Freshness {
        let Some(ttl) = self.time_to_live else {
            return Freshness::Fresh;
        };
        let Some(fresh_until) = stored_at.checked_add(ttl) else {
            return Freshness::Fresh;
        };
        if now < fresh_until {
            return Freshness::Fresh;
        }
        match self
            .stale_while_revalidate
            .and_then(|swr| fresh_until.checked_add(swr))
        {
            Some(stale_until) if now < stale_until => Freshness::Stale,
            _ => Freshness::Expired,
        }
    }
}

#[async_trait]
impl<R: Request> Resolver<R> for Persisted<R> {
    async fn run_all(&self, batch: Vec<BatchEntry<R>>) {
        let requests: Vec<R> = batch
            .iter()
            .map(|entry| entry.request().clone())
            .collect();
        let now = Instant::now();
        let stored = self.store.get_many(&requests).await;

        let mut forward: Vec<BatchEntry<R>> = Vec::new();
        match stored {
            Ok(slots) if slots.len() == batch.len() => {
                for (entry, slot) in batch.into_iter().zip(slots) {
                    let Some(found) = slot else {
                        forward.push(entry);
                        continue;
                    };
                    match self.freshness(found.stored_at, now) {
                        Freshness::Fresh => {
                            entry
                                .completion()
                                .complete(found.result.map_err(ResolverError::Failed));
                        }
                        Freshness::Stale => {
                            // Serve the stale result right away and still
                            // run the live resolver to refresh the store.
                            // The refresh gets its own completion; the
                            // caller's one is already done.
                            entry
                                .completion()
                                .complete(found.result.map_err(ResolverError::Failed));
                            forward.push(BatchEntry::new(entry.request().clone()));
                        }
                        Freshness::Expired => forward.push(entry),
                    }
                }
            }
            Ok(_) => {
                tracing::error!("request store returned a mismatched result count");
                forward = batch;
            }
            Err(error) => {
                tracing::warn!(%error, "request store read failed; falling back to the live resolver");
                forward = batch;
            }
        }
        if forward.is_empty() {
            return;
        }

        let watched: Vec<(R, Completion<R>)> = forward
            .iter()
            .map(|entry| (entry.request().clone(), entry.completion().clone()))
            .collect();

        self.inner.run_all(forward).await;

        // Write back per-request outcomes. Entries the resolver failed to
        // complete (a wholesale failure) are not persisted.
        let mut writes = Vec::new();
        for (request, completion) in watched {
            match completion.peek() {
                Some(Ok(value)) => writes.push((request, Ok(value))),
                Some(Err(ResolverError::Failed(error))) => writes.push((request, Err(error))),
                _ => {}
            }
        }
        if writes.is_empty() {
            return;
        }
        if let Err(error) = self.store.set_many(writes).await {
            tracing::warn!(%error, "request store write failed");
        }
    }

    fn batch_key(&self, request: &R) -> BatchKey {
        self.inner.batch_key(request)
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

/// Backs `resolver` with an external [`RequestStore`].
///
/// Before dispatch, all requests of a batch are bulk-read from the store:
/// fresh hits complete immediately, stale hits (within the
/// `stale_while_revalidate` window) complete immediately *and* are
/// forwarded to refresh the store, everything else goes to the live
/// resolver. Resolved outcomes are bulk-written back afterwards.
/// `time_to_live == None` means stored entries never go stale.
pub fn persisted<R: Request>(
    resolver: Arc<dyn Resolver<R>>,
    store: Arc<dyn RequestStore<R>>,
    time_to_live: Option<Duration>,
    stale_while_revalidate: Option<Duration>,
) -> Arc<dyn Resolver<R>> {
    Arc::new(Persisted {
        inner: resolver,
        store,
        time_to_live,
        stale_while_revalidate,
    })
}
