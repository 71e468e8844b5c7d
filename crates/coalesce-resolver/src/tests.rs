use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use coalesce_runtime::Duration;
use tokio::time;

use crate::{
    BatchEntry, Batcher, MemoryStore, Request, Resolver, ResolverError, Strategy, batch_n, cached,
    from_function, grouped, make, persisted, race, tagged, with_delay,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GetUser(u32);

impl Request for GetUser {
    type Ok = String;
    type Err = &'static str;
}

/// A resolver that records the ids of every batch it executes and resolves
/// each request to `"user-{id}"`.
fn recording_resolver(batches: Arc<Mutex<Vec<Vec<u32>>>>) -> Arc<dyn Resolver<GetUser>> {
    make(move |batch: Vec<BatchEntry<GetUser>>| {
        let batches = Arc::clone(&batches);
        async move {
            let ids: Vec<u32> = batch.iter().map(|entry| entry.request().0).collect();
            batches.lock().unwrap().push(ids);
            for entry in &batch {
                entry.succeed(format!("user-{}", entry.request().0));
            }
        }
    })
}

/// A resolver that resolves every request of one `run_all` call to the same
/// `"v{n}"`, where `n` counts invocations.
fn versioned_resolver(calls: Arc<AtomicUsize>) -> Arc<dyn Resolver<GetUser>> {
    make(move |batch: Vec<BatchEntry<GetUser>>| {
        let version = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            for entry in &batch {
                entry.succeed(format!("v{version}"));
            }
        }
    })
}

/// Lets the detached flusher/observer tasks of the batcher catch up.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn concurrent_asks_form_one_batch() {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let batcher = Batcher::new(recording_resolver(Arc::clone(&batches)));

    let res = futures::join!(
        batcher.ask(GetUser(1)),
        batcher.ask(GetUser(2)),
        batcher.ask(GetUser(3)),
    );

    assert_eq!(res.0.unwrap(), "user-1");
    assert_eq!(res.1.unwrap(), "user-2");
    assert_eq!(res.2.unwrap(), "user-3");
    assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2, 3]]);
}

#[tokio::test]
async fn sequential_asks_run_separate_batches() {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let batcher = Batcher::new(recording_resolver(Arc::clone(&batches)));

    batcher.ask(GetUser(1)).await.unwrap();
    batcher.ask(GetUser(2)).await.unwrap();
    assert_eq!(*batches.lock().unwrap(), vec![vec![1], vec![2]]);
}

#[tokio::test]
async fn uncompleted_entries_are_flagged() {
    // A broken resolver that only ever completes the first entry.
    let resolver = make(move |batch: Vec<BatchEntry<GetUser>>| async move {
        if let Some(first) = batch.first() {
            first.succeed("only".into());
        }
    });
    let batcher = Batcher::new(resolver);

    let (a, b) = futures::join!(batcher.ask(GetUser(1)), batcher.ask(GetUser(2)));
    assert_eq!(a.unwrap(), "only");
    assert_eq!(b.unwrap_err(), ResolverError::Incomplete);
}

#[tokio::test]
async fn from_function_resolves_each_request() {
    let batcher = Batcher::new(from_function(|request: &GetUser| {
        if request.0 == 0 {
            Err("no such user")
        } else {
            Ok(format!("user-{}", request.0))
        }
    }));

    assert_eq!(batcher.ask(GetUser(9)).await.unwrap(), "user-9");
    assert_eq!(
        batcher.ask(GetUser(0)).await.unwrap_err(),
        ResolverError::Failed("no such user")
    );
}

#[tokio::test]
async fn grouped_never_mixes_groups() {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let resolver = grouped(recording_resolver(Arc::clone(&batches)), |request: &GetUser| {
        request.0 % 2
    });
    let batcher = Batcher::new(resolver);

    let res = futures::join!(
        batcher.ask(GetUser(1)),
        batcher.ask(GetUser(2)),
        batcher.ask(GetUser(3)),
        batcher.ask(GetUser(4)),
    );
    res.0.unwrap();
    res.1.unwrap();
    res.2.unwrap();
    res.3.unwrap();

    let recorded = batches.lock().unwrap().clone();
    assert_eq!(recorded.len(), 2);
    for batch in &recorded {
        assert!(batch.iter().all(|id| id % 2 == batch[0] % 2));
    }
    let mut all = recorded.concat();
    all.sort();
    assert_eq!(all, vec![1, 2, 3, 4]);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Query {
    User(u32),
    Team(u32),
}

impl Request for Query {
    type Ok = String;
    type Err = &'static str;
}

#[tokio::test]
async fn tagged_fans_out_per_tag() {
    let resolver = tagged(
        |query: &Query| match query {
            Query::User(_) => "user",
            Query::Team(_) => "team",
        },
        |tag, queries: Vec<Query>| async move {
            if tag == "team" {
                return Err("teams are down");
            }
            Ok(queries
                .iter()
                .map(|query| match query {
                    Query::User(id) => format!("user-{id}"),
                    Query::Team(_) => unreachable!("grouped by tag"),
                })
                .collect())
        },
    );
    let batcher = Batcher::new(resolver);

    let (a, b, c) = futures::join!(
        batcher.ask(Query::User(1)),
        batcher.ask(Query::User(2)),
        batcher.ask(Query::Team(9)),
    );
    assert_eq!(a.unwrap(), "user-1");
    assert_eq!(b.unwrap(), "user-2");
    // The tag-level failure fails the whole team group with the same cause.
    assert_eq!(c.unwrap_err(), ResolverError::Failed("teams are down"));
}

#[tokio::test]
async fn batch_n_seals_before_the_window_elapses() {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let resolver = batch_n(
        with_delay(
            recording_resolver(Arc::clone(&batches)),
            Duration::from_secs(3600),
        ),
        2,
    );
    let batcher = Batcher::new(resolver);

    time::pause();
    let res = futures::join!(
        batcher.ask(GetUser(1)),
        batcher.ask(GetUser(2)),
        batcher.ask(GetUser(3)),
        batcher.ask(GetUser(4)),
    );
    res.0.unwrap();
    res.1.unwrap();
    res.2.unwrap();
    res.3.unwrap();

    // Sealed by size, not by the (hour-long) delay window.
    assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2], vec![3, 4]]);
}

#[tokio::test]
async fn cached_dedupes_identical_requests() {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let resolver = cached(recording_resolver(Arc::clone(&batches)), 8, Strategy::Lru);
    let batcher = Batcher::new(resolver);

    // In-flight dedup: the second ask chains onto the first, only one entry
    // reaches the batch.
    let (a, b) = futures::join!(batcher.ask(GetUser(7)), batcher.ask(GetUser(7)));
    assert_eq!(a.unwrap(), "user-7");
    assert_eq!(b.unwrap(), "user-7");
    assert_eq!(*batches.lock().unwrap(), vec![vec![7]]);

    // Completed dedup: later asks never reach the resolver at all.
    settle().await;
    assert_eq!(batcher.ask(GetUser(7)).await.unwrap(), "user-7");
    assert_eq!(batches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn cached_lru_evicts_the_least_recently_used() {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let resolver = cached(recording_resolver(Arc::clone(&batches)), 2, Strategy::Lru);
    let batcher = Batcher::new(resolver);

    for id in [1, 2, 1, 3, 1] {
        batcher.ask(GetUser(id)).await.unwrap();
        settle().await;
    }

    // The hit on 1 promoted it, so inserting 3 evicted 2 instead; every ask
    // for 1 after the first was a cache hit.
    let resolved: Vec<u32> = batches.lock().unwrap().concat();
    assert_eq!(resolved, vec![1, 2, 3]);
}

#[tokio::test]
async fn cached_fifo_ignores_hits_for_eviction() {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let resolver = cached(recording_resolver(Arc::clone(&batches)), 2, Strategy::Fifo);
    let batcher = Batcher::new(resolver);

    for id in [1, 2, 1, 3, 1] {
        batcher.ask(GetUser(id)).await.unwrap();
        settle().await;
    }

    // Insertion order only: 3 evicted 1 despite the intervening hit, so the
    // final ask for 1 had to be resolved again.
    let resolved: Vec<u32> = batches.lock().unwrap().concat();
    assert_eq!(resolved, vec![1, 2, 3, 1]);
}

#[tokio::test]
async fn cached_with_zero_capacity_is_disabled() {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let resolver = cached(recording_resolver(Arc::clone(&batches)), 0, Strategy::Lru);
    let batcher = Batcher::new(resolver);

    batcher.ask(GetUser(5)).await.unwrap();
    batcher.ask(GetUser(5)).await.unwrap();
    assert_eq!(*batches.lock().unwrap(), vec![vec![5], vec![5]]);
}

#[tokio::test]
async fn persisted_serves_from_store_and_writes_back() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(MemoryStore::new());
    let resolver = persisted(
        versioned_resolver(Arc::clone(&calls)),
        Arc::clone(&store) as Arc<dyn crate::RequestStore<GetUser>>,
        None,
        None,
    );
    let batcher = Batcher::new(resolver);

    assert_eq!(batcher.ask(GetUser(1)).await.unwrap(), "v0");
    settle().await;
    assert_eq!(store.len(), 1);

    // Served from the store; the live resolver is not consulted again.
    assert_eq!(batcher.ask(GetUser(1)).await.unwrap(), "v0");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persisted_expires_stored_entries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(MemoryStore::new());
    let resolver = persisted(
        versioned_resolver(Arc::clone(&calls)),
        Arc::clone(&store) as Arc<dyn crate::RequestStore<GetUser>>,
        Some(Duration::from_millis(100)),
        None,
    );
    let batcher = Batcher::new(resolver);

    time::pause();
    assert_eq!(batcher.ask(GetUser(1)).await.unwrap(), "v0");
    settle().await;

    time::advance(Duration::from_millis(50)).await;
    assert_eq!(batcher.ask(GetUser(1)).await.unwrap(), "v0");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    time::advance(Duration::from_millis(60)).await;
    assert_eq!(batcher.ask(GetUser(1)).await.unwrap(), "v1");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn persisted_stale_while_revalidate_serves_and_refreshes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(MemoryStore::new());
    let resolver = persisted(
        versioned_resolver(Arc::clone(&calls)),
        Arc::clone(&store) as Arc<dyn crate::RequestStore<GetUser>>,
        Some(Duration::from_millis(100)),
        Some(Duration::from_secs(3600)),
    );
    let batcher = Batcher::new(resolver);

    time::pause();
    assert_eq!(batcher.ask(GetUser(1)).await.unwrap(), "v0");
    settle().await;

    // Past the TTL but within the stale window: the stale value is served
    // immediately and the store refreshed behind the caller's back.
    time::advance(Duration::from_millis(150)).await;
    assert_eq!(batcher.ask(GetUser(1)).await.unwrap(), "v0");
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        store.get(&GetUser(1)).unwrap().result,
        Ok("v1".to_string())
    );

    // The refreshed entry is fresh again.
    assert_eq!(batcher.ask(GetUser(1)).await.unwrap(), "v1");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn persisted_replays_stored_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let failing = make(move |batch: Vec<BatchEntry<GetUser>>| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            for entry in &batch {
                entry.fail("no such user");
            }
        }
    });
    let store = Arc::new(MemoryStore::new());
    let resolver = persisted(
        failing,
        Arc::clone(&store) as Arc<dyn crate::RequestStore<GetUser>>,
        None,
        None,
    );
    let batcher = Batcher::new(resolver);

    assert_eq!(
        batcher.ask(GetUser(1)).await.unwrap_err(),
        ResolverError::Failed("no such user")
    );
    settle().await;

    // Domain failures are persisted and replayed without a live call.
    assert_eq!(
        batcher.ask(GetUser(1)).await.unwrap_err(),
        ResolverError::Failed("no such user")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persisted_does_not_store_wholesale_failures() {
    let broken = make(|_batch: Vec<BatchEntry<GetUser>>| async {});
    let store = Arc::new(MemoryStore::new());
    let resolver = persisted(
        broken,
        Arc::clone(&store) as Arc<dyn crate::RequestStore<GetUser>>,
        None,
        None,
    );
    let batcher = Batcher::new(resolver);

    assert_eq!(
        batcher.ask(GetUser(1)).await.unwrap_err(),
        ResolverError::Incomplete
    );
    settle().await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn race_takes_the_first_resolver_to_finish() {
    let slow = make(|batch: Vec<BatchEntry<GetUser>>| async move {
        time::sleep(Duration::from_secs(60)).await;
        for entry in &batch {
            entry.succeed("slow".into());
        }
    });
    let fast = make(|batch: Vec<BatchEntry<GetUser>>| async move {
        for entry in &batch {
            entry.succeed("fast".into());
        }
    });
    let batcher = Batcher::new(race(slow, fast));

    time::pause();
    assert_eq!(batcher.ask(GetUser(1)).await.unwrap(), "fast");
}
