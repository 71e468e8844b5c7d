use tokio::sync::watch;

/// A single-assignment, multi-reader result cell.
///
/// The first call to [`complete`](Deferred::complete) stores the value and
/// wakes every waiter; any later completion attempt is silently ignored.
/// Cloning a `Deferred` produces another handle onto the same cell.
#[derive(Debug)]
pub struct Deferred<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deferred<T> {
    /// Creates an empty cell.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Deferred { tx }
    }

    /// Completes the cell with `value`.
    ///
    /// Returns `true` if this call was the one that completed the cell, and
    /// `false` if it was already completed (the value is dropped in that
    /// case).
    pub fn complete(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = value.take();
                true
            } else {
                false
            }
        })
    }

    /// Whether the cell has been completed.
    pub fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Whether `other` is a handle onto the same cell.
    pub fn same_cell(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl<T: Clone> Deferred<T> {
    /// Suspends until the cell is completed, then returns a clone of the
    /// stored value. Returns immediately if it already is.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        let slot = rx
            .wait_for(|slot| slot.is_some())
            .await
            .expect("deferred sender lives as long as self");
        slot.clone().expect("checked some")
    }

    /// Non-blocking snapshot of the stored value, if any.
    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }
}
