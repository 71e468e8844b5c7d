use std::sync::Mutex;

use async_trait::async_trait;
use coalesce_runtime::Instant;
use rustc_hash::FxHashMap;

use crate::entry::Request;
use crate::error::StoreError;

/// A result persisted for a request, with the moment it was written.
pub struct StoredEntry<R: Request> {
    /// The persisted outcome, success or domain failure.
    pub result: Result<R::Ok, R::Err>,
    /// When the entry was written, for TTL/staleness decisions.
    pub stored_at: Instant,
}

impl<R: Request> Clone for StoredEntry<R> {
    fn clone(&self) -> Self {
        StoredEntry {
            result: self.result.clone(),
            stored_at: self.stored_at,
        }
    }
}

/// An external bulk persistence store for request results.
///
/// Used by [`persisted`](crate::persisted) to short-circuit requests whose
/// result is already stored and to write back freshly resolved ones.
#[async_trait]
pub trait RequestStore<R: Request>: Send + Sync + 'static {
    /// Reads the stored entries for `requests`, positionally.
    async fn get_many(&self, requests: &[R]) -> Result<Vec<Option<StoredEntry<R>>>, StoreError>;

    /// Writes the given results, stamping them with the current time.
    async fn set_many(&self, results: Vec<(R, Result<R::Ok, R::Err>)>) -> Result<(), StoreError>;
}

/// A trivial in-memory [`RequestStore`], mainly useful in tests.
pub struct MemoryStore<R: Request> {
    entries: Mutex<FxHashMap<R, StoredEntry<R>>>,
}

impl<R: Request> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Request> MemoryStore<R> {
    /// Creates an empty store.
    pub fn new() -> Self {
        MemoryStore {
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the stored entry for `request`, if any.
    pub fn get(&self, request: &R) -> Option<StoredEntry<R>> {
        self.entries.lock().unwrap().get(request).cloned()
    }
}

#[async_trait]
impl<R: Request> RequestStore<R> for MemoryStore<R> {
    async fn get_many(&self, requests: &[R]) -> Result<Vec<Option<StoredEntry<R>>>, StoreError> {
        let entries = self.entries.lock().unwrap();
        Ok(requests.iter().map(|r| entries.get(r).cloned()).collect())
    }

    async fn set_many(&self, results: Vec<(R, Result<R::Ok, R::Err>)>) -> Result<(), StoreError> {
        let stored_at = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        for (request, result) in results {
            entries.insert(request, StoredEntry { result, stored_at });
        }
        Ok(())
    }
}
