use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dataload_wire::wire::{ChildId, Headers, ParentId};
use dataload_wire::{BatchConfig, BatchFunction, Error, Key, Loader, Result};
use futures::future;
use parking_lot::Mutex;
use tokio::time::{self, Instant};

#[derive(Debug, Clone, PartialEq)]
struct Dispatched {
    limit: i32,
    parent_ids: Vec<ParentId>,
    headers: Headers,
}

/// Serves children from a map and records every batch it is handed.
#[derive(Default)]
struct DummyBackend {
    children: HashMap<ParentId, Vec<ChildId>>,
    dispatched: Mutex<Vec<Dispatched>>,
    failing: AtomicBool,
    /// Batches with this limit never complete.
    hang_on_limit: Option<i32>,
}

impl DummyBackend {
    fn with_children(pairs: &[(ParentId, Vec<ChildId>)]) -> Self {
        Self {
            children: pairs.iter().cloned().collect(),
            ..Default::default()
        }
    }

    fn dispatched(&self) -> Vec<Dispatched> {
        self.dispatched.lock().clone()
    }
}

#[async_trait]
impl BatchFunction for DummyBackend {
    async fn load(
        &self,
        limit: i32,
        parent_ids: &[ParentId],
        headers: &Headers,
    ) -> Result<HashMap<ParentId, Vec<ChildId>>> {
        self.dispatched.lock().push(Dispatched {
            limit,
            parent_ids: parent_ids.to_vec(),
            headers: headers.clone(),
        });
        if self.hang_on_limit == Some(limit) {
            future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        Ok(parent_ids
            .iter()
            .filter_map(|p| {
                self.children
                    .get(p)
                    .map(|c| (*p, c.iter().take(limit as usize).copied().collect()))
            })
            .collect())
    }
}

fn window(ms: u64) -> BatchConfig {
    BatchConfig::default().with_window(Duration::from_millis(ms)).with_max_batch_size(1_000)
}

fn no_headers() -> Headers {
    Headers::new()
}

async fn within<F: std::future::Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), f).await.expect("timed out")
}

#[tokio::test(start_paused = true)]
async fn one_window_one_grouped_call() {
    let backend = Arc::new(DummyBackend::with_children(&[
        (42, vec![1, 2]),
        (44, vec![9, 10, 11, 12, 13, 14, 15]),
    ]));
    let loader = Loader::with_shared(backend.clone(), window(20));

    let results = within(future::join3(
        loader.load(Key::new(42, 5), no_headers()),
        loader.load(Key::new(43, 5), no_headers()),
        loader.load(Key::new(44, 5), no_headers()),
    ))
    .await;

    assert_eq!(results.0.unwrap(), vec![1, 2]);
    assert_eq!(results.1.unwrap(), Vec::<ChildId>::new());
    assert_eq!(results.2.unwrap(), vec![9, 10, 11, 12, 13]);
    assert_eq!(
        backend.dispatched(),
        vec![Dispatched { limit: 5, parent_ids: vec![42, 43, 44], headers: no_headers() }]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tasks_share_a_batch() {
    let pairs: Vec<(ParentId, Vec<ChildId>)> =
        (0..50).map(|p| (p, vec![p * 10, p * 10 + 1])).collect();
    let backend = Arc::new(DummyBackend {
        children: pairs.into_iter().collect(),
        ..Default::default()
    });
    let loader = Arc::new(Loader::with_shared(backend.clone(), window(300)));

    let tasks = (0..50).map(|p| {
        let loader = loader.clone();
        tokio::spawn(async move { (p, loader.load(Key::new(p, 2), Headers::new()).await) })
    });
    for joined in within(future::join_all(tasks)).await {
        let (p, children) = joined.unwrap();
        assert_eq!(children.unwrap(), vec![p * 10, p * 10 + 1]);
    }

    let dispatched = backend.dispatched();
    assert_eq!(dispatched.len(), 1);
    let mut parents = dispatched[0].parent_ids.clone();
    parents.sort_unstable();
    assert_eq!(parents, (0..50).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn limits_never_mix() {
    let backend =
        Arc::new(DummyBackend::with_children(&[(1, vec![1, 2, 3, 4]), (2, vec![5, 6, 7])]));
    let loader = Loader::with_shared(backend.clone(), window(20));

    let (a, b, c) = within(future::join3(
        loader.load(Key::new(1, 1), no_headers()),
        loader.load(Key::new(2, 2), no_headers()),
        loader.load(Key::new(1, 2), no_headers()),
    ))
    .await;
    assert_eq!(a.unwrap(), vec![1]);
    assert_eq!(b.unwrap(), vec![5, 6]);
    assert_eq!(c.unwrap(), vec![1, 2]);

    let mut dispatched = backend.dispatched();
    dispatched.sort_by_key(|d| d.limit);
    assert_eq!(dispatched.len(), 2);
    assert_eq!((dispatched[0].limit, dispatched[0].parent_ids.clone()), (1, vec![1]));
    assert_eq!((dispatched[1].limit, dispatched[1].parent_ids.clone()), (2, vec![2, 1]));
}

#[tokio::test(start_paused = true)]
async fn duplicate_parents_are_requested_once() {
    let backend = Arc::new(DummyBackend::with_children(&[(7, vec![70, 71])]));
    let loader = Loader::with_shared(backend.clone(), window(20));

    let (a, b) = within(future::join(
        loader.load(Key::new(7, 5), no_headers()),
        loader.load(Key::new(7, 5), no_headers()),
    ))
    .await;
    assert_eq!(a.unwrap(), vec![70, 71]);
    assert_eq!(b.unwrap(), vec![70, 71]);
    assert_eq!(backend.dispatched()[0].parent_ids, vec![7]);
}

#[tokio::test(start_paused = true)]
async fn failure_fans_out_to_the_whole_batch() {
    let backend = Arc::new(DummyBackend::with_children(&[(1, vec![10])]));
    backend.failing.store(true, Ordering::SeqCst);
    let loader = Loader::with_shared(backend.clone(), window(20));

    let results = within(future::join_all(vec![
        loader.load(Key::new(1, 5), no_headers()),
        loader.load(Key::new(2, 5), no_headers()),
        loader.load(Key::new(3, 5), no_headers()),
    ]))
    .await;
    assert_eq!(backend.dispatched().len(), 1);
    for result in results {
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    backend.failing.store(false, Ordering::SeqCst);
    let later = within(loader.load(Key::new(1, 5), no_headers())).await;
    assert_eq!(later.unwrap(), vec![10]);
    assert_eq!(loader.stats().failed_batches, 1);
}

#[tokio::test(start_paused = true)]
async fn a_stuck_batch_does_not_hold_up_other_batches() {
    let backend = Arc::new(DummyBackend {
        children: [(1, vec![11]), (2, vec![22])].into_iter().collect(),
        hang_on_limit: Some(9),
        ..Default::default()
    });
    let loader = Loader::with_shared(backend.clone(), window(10));

    let stuck = loader.load(Key::new(1, 9), no_headers());
    let fine = within(loader.load(Key::new(2, 5), no_headers())).await;
    assert_eq!(fine.unwrap(), vec![22]);

    let still_stuck = tokio::time::timeout(Duration::from_millis(50), stuck).await;
    assert!(still_stuck.is_err());
}

#[tokio::test(start_paused = true)]
async fn no_caching_across_batches() {
    let backend = Arc::new(DummyBackend::with_children(&[(1, vec![100])]));
    let loader = Loader::with_shared(backend.clone(), window(5));

    assert_eq!(within(loader.load(Key::new(1, 5), no_headers())).await.unwrap(), vec![100]);
    assert_eq!(within(loader.load(Key::new(1, 5), no_headers())).await.unwrap(), vec![100]);
    assert_eq!(backend.dispatched().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn full_batch_dispatches_before_its_window() {
    let backend = Arc::new(DummyBackend::with_children(&[(1, vec![1]), (4, vec![4])]));
    let config = BatchConfig::default()
        .with_window(Duration::from_secs(3600))
        .with_max_batch_size(3);
    let loader = Loader::with_shared(backend.clone(), config);

    let full = future::join_all((1..=3).map(|p| loader.load(Key::new(p, 5), no_headers())));
    let results = within(full).await;
    assert_eq!(results[0].as_ref().unwrap(), &vec![1]);
    assert_eq!(backend.dispatched().len(), 1);

    // The next key opens a fresh batch, which waits for its window.
    let next = loader.load(Key::new(4, 5), no_headers());
    tokio::task::yield_now().await;
    assert_eq!(backend.dispatched().len(), 1);
    loader.flush();
    assert_eq!(within(next).await.unwrap(), vec![4]);
    assert_eq!(backend.dispatched()[1].parent_ids, vec![4]);

    let stats = loader.stats();
    assert_eq!(stats.batches, 2);
    assert_eq!(stats.full_batches, 1);
    assert_eq!(stats.load_requests, 4);
}

#[tokio::test(start_paused = true)]
async fn abandoned_load_stays_in_its_batch() {
    let backend = Arc::new(DummyBackend::with_children(&[(2, vec![20])]));
    let loader = Loader::with_shared(backend.clone(), window(20));

    drop(loader.load(Key::new(1, 5), no_headers()));
    let kept = within(loader.load(Key::new(2, 5), no_headers())).await;

    assert_eq!(kept.unwrap(), vec![20]);
    assert_eq!(backend.dispatched()[0].parent_ids, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn batch_forwards_first_callers_headers() {
    let backend = Arc::new(DummyBackend::default());
    let loader = Loader::with_shared(backend.clone(), window(20));

    let mut first = Headers::new();
    first.insert("traceparent".to_owned(), "00-abc-def-01".to_owned());
    let mut second = Headers::new();
    second.insert("traceparent".to_owned(), "00-123-456-01".to_owned());

    let _ = within(future::join(
        loader.load(Key::new(1, 5), first.clone()),
        loader.load(Key::new(2, 5), second),
    ))
    .await;
    assert_eq!(backend.dispatched()[0].headers, first);
}

#[tokio::test(start_paused = true)]
async fn load_many_keeps_request_order() {
    let backend = Arc::new(DummyBackend::with_children(&[(5, vec![50]), (8, vec![80, 81])]));
    let loader = Loader::with_shared(backend.clone(), window(20));

    let results = within(loader.load_many(&[8, 12, 5], 5, no_headers())).await;
    let results: Vec<Vec<ChildId>> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(results, vec![vec![80, 81], vec![], vec![50]]);
    assert_eq!(backend.dispatched().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_loader_fails_outstanding_loads() {
    let backend = Arc::new(DummyBackend::default());
    let loader = Loader::with_shared(backend, window(60_000));

    let pending = loader.load(Key::new(1, 5), no_headers());
    drop(loader);
    assert!(matches!(within(pending).await, Err(Error::LoaderClosed)));
}

#[tokio::test(start_paused = true)]
async fn batch_waits_out_its_window() {
    let backend = Arc::new(DummyBackend::with_children(&[(3, vec![30])]));
    let loader = Loader::with_shared(backend.clone(), window(20));
    let start = Instant::now();

    let pending = loader.load(Key::new(3, 5), no_headers());
    tokio::task::yield_now().await;
    time::advance(Duration::from_millis(19)).await;
    assert!(backend.dispatched().is_empty());

    assert_eq!(within(pending).await.unwrap(), vec![30]);
    assert_eq!(backend.dispatched().len(), 1);
    assert!(start.elapsed() >= Duration::from_millis(20));
}

/// Collects formatted log lines for assertions.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn dropping_the_loader_logs_worker_stats() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let backend = Arc::new(DummyBackend::with_children(&[(1, vec![10])]));
    let loader = Loader::with_shared(backend, window(20));
    assert_eq!(within(loader.load(Key::new(1, 5), no_headers())).await.unwrap(), vec![10]);
    drop(loader);

    let logs = logs.contents();
    assert!(logs.contains("Terminating LoaderWorker"), "{}", logs);
    assert!(logs.contains("load_requests: 1"), "{}", logs);
    assert!(logs.contains("batches: 1"), "{}", logs);
}
