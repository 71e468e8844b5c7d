use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::{BoxFuture, join_all};
use indexmap::IndexMap;
use tokio::task::JoinHandle;

use coalesce_runtime::{Deferred, Duration, Instant, Scope};

use crate::CacheError;

type Lookup<K, V, E> = dyn Fn(K, Arc<Scope>) -> BoxFuture<'static, Result<V, E>> + Send + Sync;
type TimeToLive<K, V, E> = dyn Fn(&Result<V, E>, &K) -> Option<Duration> + Send + Sync;

/// A single cache slot: the shared result cell, the scope owning the
/// resources of the cached value, and the expiry deadline.
///
/// `expires_at` is set exactly once, when the lookup finishes. While it is
/// unset the entry is in flight and never considered expired. The stored
/// `None` means "never expires".
struct Entry<V, E> {
    deferred: Deferred<Result<V, CacheError<E>>>,
    scope: Arc<Scope>,
    expires_at: OnceLock<Option<Instant>>,
    lookup_task: Mutex<Option<JoinHandle<()>>>,
}

impl<V, E> Entry<V, E> {
    fn open() -> Arc<Self> {
        Arc::new(Entry {
            deferred: Deferred::new(),
            scope: Scope::new(),
            expires_at: OnceLock::new(),
            lookup_task: Mutex::new(None),
        })
    }

    fn completed(result: Result<V, CacheError<E>>, expires_at: Option<Instant>) -> Arc<Self> {
        let entry = Self::open();
        let _ = entry.expires_at.set(expires_at);
        entry.deferred.complete(result);
        entry
    }

    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at.get() {
            Some(Some(deadline)) => now >= *deadline,
            _ => false,
        }
    }

    /// Tears the entry down after it has been removed from the map.
    ///
    /// Aborts a still-running lookup, fails pending waiters with `Closed`
    /// (a no-op on completed entries) and forks the scope close onto a
    /// detached task. The caller joins the returned handle before its
    /// operation returns.
    fn start_close(&self) -> JoinHandle<()> {
        if let Some(task) = self.lookup_task.lock().unwrap().take() {
            task.abort();
        }
        self.deferred.complete(Err(CacheError::Closed));
        self.scope.spawn_close()
    }
}

enum CacheState<K, V, E> {
    Open(IndexMap<K, Arc<Entry<V, E>>>),
    Closed,
}

/// Result of the locked slot-claiming phase of [`ScopedCache::get`].
enum Claim<V, E> {
    Hit(Deferred<Result<V, CacheError<E>>>),
    Miss {
        entry: Arc<Entry<V, E>>,
        closes: Vec<JoinHandle<()>>,
    },
}

struct Inner<K, V, E> {
    state: Mutex<CacheState<K, V, E>>,
    capacity: usize,
    lookup: Box<Lookup<K, V, E>>,
    time_to_live: Box<TimeToLive<K, V, E>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Hit/miss counters and the current live entry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from a live entry.
    pub hits: u64,
    /// Reads that had to claim a fresh slot (or found nothing).
    pub misses: u64,
    /// Live entries, including in-flight ones. Zero once closed.
    pub size: usize,
}

/// A capacity-bounded, expiring cache of asynchronously computed values,
/// where every value owns a release [`Scope`].
///
/// See the [crate docs](crate) for the full semantics. All clones share the
/// same underlying cache.
pub struct ScopedCache<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for ScopedCache<K, V, E> {
    fn clone(&self) -> Self {
        ScopedCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> std::fmt::Debug for ScopedCache<K, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let size = match &*self.inner.state.lock().unwrap() {
            CacheState::Open(map) => Some(map.len()),
            CacheState::Closed => None,
        };
        f.debug_struct("ScopedCache")
            .field("capacity", &self.inner.capacity)
            .field("entries", &size)
            .finish()
    }
}

/// Evicts oldest-first until the map fits the capacity again.
///
/// The freshly inserted entry sits at the back of the iteration order, so it
/// is never its own victim.
fn enforce_capacity<K, V, E>(
    map: &mut IndexMap<K, Arc<Entry<V, E>>>,
    capacity: usize,
    closes: &mut Vec<JoinHandle<()>>,
) where
    K: Eq + Hash,
{
    while map.len() > capacity {
        let Some((_, victim)) = map.shift_remove_index(0) else {
            break;
        };
        tracing::trace!("evicting oldest entry over capacity");
        closes.push(victim.start_close());
    }
}

impl<K, V, E> ScopedCache<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a cache whose entries never expire.
    ///
    /// `lookup` is invoked once per missing key; resources it acquires
    /// should be registered on the [`Scope`] it receives, which is closed
    /// when the entry is evicted. `capacity` must be positive.
    pub fn new<L, Fut>(capacity: usize, lookup: L) -> Self
    where
        L: Fn(K, Arc<Scope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        Self::with_time_to_live(capacity, lookup, |_result, _key| None)
    }

    /// Creates a cache with a per-result time-to-live policy.
    ///
    /// `time_to_live` runs once per finished lookup (success or failure);
    /// returning `None` means the entry never expires, `Some(ZERO)` means it
    /// is expired immediately, which is how "don't cache failures" is
    /// expressed.
    pub fn with_time_to_live<L, Fut, T>(capacity: usize, lookup: L, time_to_live: T) -> Self
    where
        L: Fn(K, Arc<Scope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        T: Fn(&Result<V, E>, &K) -> Option<Duration> + Send + Sync + 'static,
    {
        assert!(capacity > 0, "cache capacity must be positive");
        ScopedCache {
            inner: Arc::new(Inner {
                state: Mutex::new(CacheState::Open(IndexMap::new())),
                capacity,
                lookup: Box::new(move |key, scope| -> BoxFuture<'static, Result<V, E>> {
                    Box::pin(lookup(key, scope))
                }),
                time_to_live: Box::new(time_to_live),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Ties the cache's lifetime to `scope`: closing the scope closes the
    /// cache.
    pub async fn bind_to_scope(&self, scope: &Scope) {
        let cache = self.clone();
        scope.add_finalizer(async move { cache.close().await }).await;
    }

    /// Returns the cached value for `key`, invoking the lookup on a miss.
    ///
    /// Concurrent callers for the same key share one lookup invocation; all
    /// of them await the same result cell, and dropping one caller's future
    /// does not cancel the shared computation. Lookup failures are cached
    /// and replayed exactly like successes, subject to the TTL policy.
    pub async fn get(&self, key: K) -> Result<V, CacheError<E>> {
        let claim = {
            let now = Instant::now();
            let mut state = self.inner.state.lock().unwrap();
            let map = match &mut *state {
                CacheState::Open(map) => map,
                CacheState::Closed => return Err(CacheError::Closed),
            };

            match map.get_index_of(&key) {
                Some(index) if !map[index].is_expired(now) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    let last = map.len() - 1;
                    map.move_index(index, last);
                    Claim::Hit(map[last].deferred.clone())
                }
                existing => {
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    let mut closes = Vec::new();
                    if existing.is_some() {
                        if let Some(stale) = map.shift_remove(&key) {
                            closes.push(stale.start_close());
                        }
                    }
                    let entry = Entry::open();
                    map.insert(key.clone(), Arc::clone(&entry));
                    enforce_capacity(map, self.inner.capacity, &mut closes);
                    Claim::Miss { entry, closes }
                }
            }
        };

        match claim {
            Claim::Hit(deferred) => deferred.wait().await,
            Claim::Miss { entry, closes } => {
                self.spawn_lookup(key, &entry);
                join_all(closes).await;
                entry.deferred.wait().await
            }
        }
    }

    /// Like [`get`](Self::get), but returns `None` instead of invoking the
    /// lookup when the key is absent.
    ///
    /// A hit still promotes the entry and awaits its result; an expired
    /// entry encountered on the way is evicted as a side effect.
    pub async fn get_option(&self, key: &K) -> Result<Option<V>, CacheError<E>> {
        enum Outcome<V, E> {
            Found(Deferred<Result<V, CacheError<E>>>),
            Expired(JoinHandle<()>),
            Absent,
        }

        let outcome = {
            let now = Instant::now();
            let mut state = self.inner.state.lock().unwrap();
            let map = match &mut *state {
                CacheState::Open(map) => map,
                CacheState::Closed => return Err(CacheError::Closed),
            };

            match map.get_index_of(key) {
                Some(index) if !map[index].is_expired(now) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    let last = map.len() - 1;
                    map.move_index(index, last);
                    Outcome::Found(map[last].deferred.clone())
                }
                Some(index) => {
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    let (_, stale) = map
                        .shift_remove_index(index)
                        .expect("index taken under the same lock");
                    Outcome::Expired(stale.start_close())
                }
                None => {
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    Outcome::Absent
                }
            }
        };

        match outcome {
            Outcome::Found(deferred) => deferred.wait().await.map(Some),
            Outcome::Expired(close) => {
                let _ = close.await;
                Ok(None)
            }
            Outcome::Absent => Ok(None),
        }
    }

    /// Non-blocking peek: returns the value only if an entry exists, is
    /// unexpired and has already completed successfully.
    ///
    /// Read-only; neither promotes nor evicts.
    pub fn get_success(&self, key: &K) -> Option<V> {
        let state = self.inner.state.lock().unwrap();
        let CacheState::Open(map) = &*state else {
            return None;
        };
        let entry = map.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        match entry.deferred.peek() {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    /// Unconditionally installs `value` as a pre-completed entry, bypassing
    /// the lookup. Replaces (and closes) any prior entry for the key.
    pub async fn set(&self, key: K, value: V) -> Result<(), CacheError<E>> {
        let result: Result<V, E> = Ok(value);
        let ttl = (self.inner.time_to_live)(&result, &key);
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        let entry = Entry::completed(result.map_err(CacheError::Lookup), expires_at);

        let closes = {
            let mut state = self.inner.state.lock().unwrap();
            let map = match &mut *state {
                CacheState::Open(map) => map,
                CacheState::Closed => return Err(CacheError::Closed),
            };
            let mut closes = Vec::new();
            if let Some(old) = map.shift_remove(&key) {
                closes.push(old.start_close());
            }
            map.insert(key, entry);
            enforce_capacity(map, self.inner.capacity, &mut closes);
            closes
        };
        join_all(closes).await;
        Ok(())
    }

    /// Whether a live entry exists for `key`.
    ///
    /// Evicts an expired entry as a side effect but does not promote.
    pub async fn has(&self, key: &K) -> Result<bool, CacheError<E>> {
        let (present, close) = {
            let now = Instant::now();
            let mut state = self.inner.state.lock().unwrap();
            let map = match &mut *state {
                CacheState::Open(map) => map,
                CacheState::Closed => return Err(CacheError::Closed),
            };
            match map.get_index_of(key) {
                Some(index) if !map[index].is_expired(now) => (true, None),
                Some(index) => {
                    let (_, stale) = map
                        .shift_remove_index(index)
                        .expect("index taken under the same lock");
                    (false, Some(stale.start_close()))
                }
                None => (false, None),
            }
        };
        if let Some(close) = close {
            let _ = close.await;
        }
        Ok(present)
    }

    /// Removes the entry for `key` and closes its scope. No-op if absent;
    /// calling it twice is equivalent to calling it once.
    pub async fn invalidate(&self, key: &K) -> Result<(), CacheError<E>> {
        let close = {
            let mut state = self.inner.state.lock().unwrap();
            let map = match &mut *state {
                CacheState::Open(map) => map,
                CacheState::Closed => return Err(CacheError::Closed),
            };
            map.shift_remove(key).map(|entry| entry.start_close())
        };
        if let Some(close) = close {
            let _ = close.await;
        }
        Ok(())
    }

    /// Awaits the current value for `key` and invalidates the entry if
    /// `predicate` holds for it.
    ///
    /// Returns whether an invalidation happened. A missing entry, a failed
    /// or interrupted value, a concurrently closed cache, or an entry that
    /// was concurrently replaced all count as "not invalidated".
    pub async fn invalidate_when<F>(&self, key: &K, predicate: F) -> bool
    where
        F: FnOnce(&V) -> bool,
    {
        let entry = {
            let state = self.inner.state.lock().unwrap();
            let CacheState::Open(map) = &*state else {
                return false;
            };
            match map.get(key) {
                Some(entry) => Arc::clone(entry),
                None => return false,
            }
        };

        let value = match entry.deferred.wait().await {
            Ok(value) => value,
            Err(_) => return false,
        };
        if !predicate(&value) {
            return false;
        }

        let close = {
            let mut state = self.inner.state.lock().unwrap();
            let CacheState::Open(map) = &mut *state else {
                return false;
            };
            match map.get(key) {
                // Only invalidate the exact entry the predicate saw.
                Some(current) if Arc::ptr_eq(current, &entry) => map
                    .shift_remove(key)
                    .expect("present under the same lock")
                    .start_close(),
                _ => return false,
            }
        };
        let _ = close.await;
        true
    }

    /// Forces a fresh lookup for `key` regardless of freshness.
    ///
    /// The new entry is swapped in only once the lookup has finished, so
    /// concurrent readers keep observing the old value until then. The
    /// refresh itself survives caller cancellation; if the cache closes
    /// mid-refresh the fresh scope is closed and the call fails with
    /// [`CacheError::Closed`].
    pub async fn refresh(&self, key: K) -> Result<V, CacheError<E>> {
        {
            let state = self.inner.state.lock().unwrap();
            if matches!(*state, CacheState::Closed) {
                return Err(CacheError::Closed);
            }
        }

        let entry = Entry::open();
        let inner = Arc::clone(&self.inner);
        let task_entry = Arc::clone(&entry);
        let lookup = (self.inner.lookup)(key.clone(), Arc::clone(&entry.scope));

        let task = tokio::spawn(async move {
            let result = lookup.await;
            let ttl = (inner.time_to_live)(&result, &key);
            let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
            let _ = task_entry.expires_at.set(expires_at);
            let stored = result.map_err(CacheError::Lookup);

            let closes = {
                let mut state = inner.state.lock().unwrap();
                match &mut *state {
                    CacheState::Open(map) => {
                        let mut closes = Vec::new();
                        if let Some(old) = map.shift_remove(&key) {
                            closes.push(old.start_close());
                        }
                        map.insert(key, Arc::clone(&task_entry));
                        enforce_capacity(map, inner.capacity, &mut closes);
                        Some(closes)
                    }
                    CacheState::Closed => None,
                }
            };

            match closes {
                Some(closes) => {
                    task_entry.deferred.complete(stored);
                    join_all(closes).await;
                }
                None => {
                    task_entry.deferred.complete(Err(CacheError::Closed));
                    task_entry.scope.close().await;
                }
            }
        });
        *entry.lookup_task.lock().unwrap() = Some(task);

        entry.deferred.wait().await
    }

    /// Removes every entry and closes all their scopes concurrently.
    pub async fn invalidate_all(&self) -> Result<(), CacheError<E>> {
        let closes = {
            let mut state = self.inner.state.lock().unwrap();
            let map = match &mut *state {
                CacheState::Open(map) => map,
                CacheState::Closed => return Err(CacheError::Closed),
            };
            map.drain(..)
                .map(|(_, entry)| entry.start_close())
                .collect::<Vec<_>>()
        };
        join_all(closes).await;
        Ok(())
    }

    /// Number of live entries, in-flight ones included.
    pub fn size(&self) -> Result<usize, CacheError<E>> {
        match &*self.inner.state.lock().unwrap() {
            CacheState::Open(map) => Ok(map.len()),
            CacheState::Closed => Err(CacheError::Closed),
        }
    }

    /// Keys of all unexpired, successfully completed entries, oldest first.
    /// Expired entries encountered during the scan are evicted.
    pub async fn keys(&self) -> Result<Vec<K>, CacheError<E>> {
        Ok(self.entries().await?.into_iter().map(|(key, _)| key).collect())
    }

    /// Values of all unexpired, successfully completed entries, oldest
    /// first. Expired entries encountered during the scan are evicted.
    pub async fn values(&self) -> Result<Vec<V>, CacheError<E>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// Key/value pairs of all unexpired, successfully completed entries,
    /// oldest first.
    ///
    /// Pending and failed entries are skipped; expired entries encountered
    /// during the scan are evicted, with the same side effect an individual
    /// expiry check would have.
    pub async fn entries(&self) -> Result<Vec<(K, V)>, CacheError<E>> {
        let (items, closes) = {
            let now = Instant::now();
            let mut state = self.inner.state.lock().unwrap();
            let map = match &mut *state {
                CacheState::Open(map) => map,
                CacheState::Closed => return Err(CacheError::Closed),
            };

            let mut expired = Vec::new();
            let mut items = Vec::new();
            for (key, entry) in map.iter() {
                if entry.is_expired(now) {
                    expired.push(key.clone());
                    continue;
                }
                if let Some(Ok(value)) = entry.deferred.peek() {
                    items.push((key.clone(), value));
                }
            }

            let mut closes = Vec::new();
            for key in expired {
                if let Some(entry) = map.shift_remove(&key) {
                    closes.push(entry.start_close());
                }
            }
            (items, closes)
        };
        join_all(closes).await;
        Ok(items)
    }

    /// Closes the cache: transitions to the terminal state and closes every
    /// live entry's scope concurrently. Idempotent. All subsequent
    /// operations fail with [`CacheError::Closed`].
    pub async fn close(&self) {
        let closes = {
            let mut state = self.inner.state.lock().unwrap();
            match std::mem::replace(&mut *state, CacheState::Closed) {
                CacheState::Open(map) => map
                    .into_values()
                    .map(|entry| entry.start_close())
                    .collect::<Vec<_>>(),
                CacheState::Closed => Vec::new(),
            }
        };
        if !closes.is_empty() {
            tracing::debug!(entries = closes.len(), "closing cache");
        }
        join_all(closes).await;
    }

    /// Snapshot of the hit/miss counters and current size.
    pub fn stats(&self) -> CacheStats {
        let size = match &*self.inner.state.lock().unwrap() {
            CacheState::Open(map) => map.len(),
            CacheState::Closed => 0,
        };
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            size,
        }
    }

    /// Claims are established under the state lock; the lookup itself runs
    /// on a detached task so that dropping the claiming caller does not
    /// cancel the computation other waiters share.
    fn spawn_lookup(&self, key: K, entry: &Arc<Entry<V, E>>) {
        let inner = Arc::clone(&self.inner);
        let task_entry = Arc::clone(entry);
        let lookup = (self.inner.lookup)(key.clone(), Arc::clone(&entry.scope));

        let task = tokio::spawn(async move {
            let result = lookup.await;
            let ttl = (inner.time_to_live)(&result, &key);
            let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
            let _ = task_entry.expires_at.set(expires_at);
            task_entry.deferred.complete(result.map_err(CacheError::Lookup));
        });
        *entry.lookup_task.lock().unwrap() = Some(task);
    }
}
