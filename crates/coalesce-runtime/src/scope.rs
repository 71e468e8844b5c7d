use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

type Finalizer = BoxFuture<'static, ()>;

enum ScopeState {
    Open(Vec<Finalizer>),
    Closed,
}

/// A closeable finalizer registry.
///
/// Every resource acquired on behalf of a cache entry is registered against
/// the entry's scope; closing the scope releases all of them, in reverse
/// registration order. `close` is idempotent: the first caller runs the
/// finalizers, everybody else returns immediately.
pub struct Scope {
    state: Mutex<ScopeState>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock().unwrap() {
            ScopeState::Open(finalizers) => format!("Open({} finalizers)", finalizers.len()),
            ScopeState::Closed => "Closed".into(),
        };
        f.debug_struct("Scope").field("state", &state).finish()
    }
}

impl Scope {
    /// Creates a fresh, open scope.
    pub fn new() -> Arc<Self> {
        Arc::new(Scope {
            state: Mutex::new(ScopeState::Open(Vec::new())),
        })
    }

    /// Registers an async finalizer to run when the scope is closed.
    ///
    /// If the scope is already closed the finalizer runs right away, so a
    /// release action can never be silently dropped.
    pub async fn add_finalizer<F>(&self, finalizer: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let boxed: Finalizer = Box::pin(finalizer);
        {
            let mut state = self.state.lock().unwrap();
            if let ScopeState::Open(finalizers) = &mut *state {
                finalizers.push(boxed);
                return;
            }
        }
        boxed.await;
    }

    /// Whether the scope has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock().unwrap(), ScopeState::Closed)
    }

    /// Closes the scope, running all registered finalizers in reverse
    /// registration order.
    ///
    /// Only the first caller runs anything; concurrent and repeated calls
    /// return immediately.
    pub async fn close(&self) {
        let finalizers = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, ScopeState::Closed) {
                ScopeState::Open(finalizers) => finalizers,
                ScopeState::Closed => return,
            }
        };
        for finalizer in finalizers.into_iter().rev() {
            finalizer.await;
        }
    }

    /// Forks `close` onto a detached task, returning its handle.
    ///
    /// This is the eviction path: slow finalizers must not block map
    /// mutation, but callers still join the returned handles before their
    /// operation returns.
    pub fn spawn_close(self: &Arc<Self>) -> JoinHandle<()> {
        let scope = Arc::clone(self);
        tokio::spawn(async move { scope.close().await })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn finalizers_run_in_reverse_order() {
        let scope = Scope::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            scope
                .add_finalizer(async move { order.lock().unwrap().push(i) })
                .await;
        }

        scope.close().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let scope = Scope::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        scope
            .add_finalizer(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        scope.close().await;
        scope.close().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(scope.is_closed());
    }

    #[tokio::test]
    async fn late_finalizer_runs_immediately() {
        let scope = Scope::new();
        scope.close().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        scope
            .add_finalizer(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawn_close_joins() {
        let scope = Scope::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        scope
            .add_finalizer(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        scope.spawn_close().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
