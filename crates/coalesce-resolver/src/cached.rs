use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use coalesce_runtime::Duration;
use indexmap::IndexMap;

use crate::entry::{BatchEntry, Completion, Request, RequestResult};
use crate::resolver::{BatchKey, Resolver};

/// Eviction discipline of the [`cached`] wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Hits promote their entry; the least recently used one is evicted.
    Lru,
    /// Strict insertion order; hits do not affect eviction.
    Fifo,
}

/// One cached request: either the live completion of an in-flight ask, or
/// the stored result of a finished one.
enum Slot<R: Request> {
    InFlight(Completion<R>),
    Done(RequestResult<R>),
}

struct CachedState<R: Request> {
    capacity: usize,
    strategy: Strategy,
    entries: Mutex<IndexMap<R, Slot<R>>>,
}

impl<R: Request> CachedState<R> {
    /// Upgrades the in-flight slot to its final result, unless the slot was
    /// evicted or replaced in the meantime.
    fn store_done(&self, request: &R, completion: &Completion<R>, result: RequestResult<R>) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(slot) = entries.get_mut(request) {
            match slot {
                Slot::InFlight(current) if current.same_cell(completion) => {
                    *slot = Slot::Done(result);
                }
                _ => {}
            }
        }
    }

    /// Trims to capacity, oldest first. Runs after each batch so in-flight
    /// requests from the batch just dispatched are not their own victims.
    fn evict(&self) {
        let mut entries = self.entries.lock().unwrap();
        while entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
    }
}

struct Cached<R: Request> {
    inner: Arc<dyn Resolver<R>>,
    state: Arc<CachedState<R>>,
}

enum Hit<R: Request> {
    Done(RequestResult<R>),
    InFlight(Completion<R>),
    Miss,
}

#[async_trait]
impl<R: Request> Resolver<R> for Cached<R> {
    async fn run_all(&self, batch: Vec<BatchEntry<R>>) {
        self.inner.run_all(batch).await;
        self.state.evict();
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
        if self.state.capacity == 0 {
            // Cache disabled: pass everything through.
            return self.inner.pre_check(entry).await;
        }

        let hit = {
            let mut entries = self.state.entries.lock().unwrap();
            match entries.get_index_of(entry.request()) {
                Some(mut index) => {
                    if self.state.strategy == Strategy::Lru {
                        let last = entries.len() - 1;
                        entries.move_index(index, last);
                        index = last;
                    }
                    match &entries[index] {
                        Slot::Done(result) => Hit::Done(result.clone()),
                        Slot::InFlight(completion) => Hit::InFlight(completion.clone()),
                    }
                }
                None => {
                    entries.insert(
                        entry.request().clone(),
                        Slot::InFlight(entry.completion().clone()),
                    );
                    Hit::Miss
                }
            }
        };

        match hit {
            Hit::Done(result) => {
                entry.completion().complete(result);
                None
            }
            Hit::InFlight(first) => {
                // Chain this waiter onto the in-flight ask; everyone
                // completes when the single underlying call resolves.
                let completion = entry.completion().clone();
                tokio::spawn(async move {
                    let result = first.wait().await;
                    completion.complete(result);
                });
                None
            }
            Hit::Miss => {
                // First ask for this request: watch its completion so the
                // result is stored for latecomers.
                let state = Arc::clone(&self.state);
                let request = entry.request().clone();
                let completion = entry.completion().clone();
                tokio::spawn(async move {
                    let result = completion.wait().await;
                    state.store_done(&request, &completion, result);
                });
                self.inner.pre_check(entry).await
            }
        }
    }
}

/// Wraps a resolver with a bounded, request-identity-keyed dedup cache.
///
/// The first ask for a request enters the batch; identical asks are served
/// from the stored result, or chained onto the in-flight completion if the
/// first call has not resolved yet. The cache is trimmed to `capacity`
/// after each batch; `capacity == 0` disables caching entirely.
pub fn cached<R: Request>(
    resolver: Arc<dyn Resolver<R>>,
    capacity: usize,
    strategy: Strategy,
) -> Arc<dyn Resolver<R>> {
    Arc::new(Cached {
        inner: resolver,
        state: Arc::new(CachedState {
            capacity,
            strategy,
            entries: Mutex::new(IndexMap::new()),
        }),
    })
}
