use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::invoke::{Invocation, Invoke, Worker};
use crate::registry::RunId;

use super::WorkerPool;

/// Mock worker that reports its disposal.
#[derive(Debug)]
struct MockWorker {
    id: usize,
    terminated: Arc<AtomicUsize>,
}

impl Worker for MockWorker {
    fn terminate(self) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
struct MockTask {
    value: u32,
    delay_ms: u64,
    fail: bool,
}

fn task(value: u32, delay_ms: u64) -> MockTask {
    MockTask { value, delay_ms, fail: false }
}

fn failing(value: u32, delay_ms: u64) -> MockTask {
    MockTask { value, delay_ms, fail: true }
}

/// One observed invocation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Start {
    value: u32,
    worker: usize,
    at_ms: u64,
}

/// Shared observation point for the mock invoker.
struct Probe {
    epoch: Instant,
    created: AtomicUsize,
    terminated: Arc<AtomicUsize>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    finished: AtomicUsize,
    starts: Mutex<Vec<Start>>,
}

impl Probe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            created: AtomicUsize::new(0),
            terminated: Arc::new(AtomicUsize::new(0)),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
        })
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn starts(&self) -> Vec<Start> {
        self.starts.lock().unwrap().clone()
    }

    fn started_values(&self) -> Vec<u32> {
        self.starts().iter().map(|s| s.value).collect()
    }
}

struct MockInvoker {
    probe: Arc<Probe>,
}

#[async_trait]
impl Invoke for MockInvoker {
    type Worker = MockWorker;
    type Args = MockTask;
    type Output = u32;

    async fn invoke(
        &self,
        worker: Option<MockWorker>,
        task: MockTask,
    ) -> anyhow::Result<Invocation<MockWorker, u32>> {
        let probe = &self.probe;
        let worker = worker.unwrap_or_else(|| MockWorker {
            id: probe.created.fetch_add(1, Ordering::SeqCst),
            terminated: Arc::clone(&probe.terminated),
        });

        let now = probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
        probe.starts.lock().unwrap().push(Start {
            value: task.value,
            worker: worker.id,
            at_ms: probe.epoch.elapsed().as_millis() as u64,
        });

        tokio::time::sleep(Duration::from_millis(task.delay_ms)).await;

        probe.in_flight.fetch_sub(1, Ordering::SeqCst);
        probe.finished.fetch_add(1, Ordering::SeqCst);
        if task.fail {
            anyhow::bail!("worker {} crashed on task {}", worker.id, task.value);
        }
        Ok(Invocation::new(worker, task.value * 10))
    }
}

fn mock_pool(pool_size: usize) -> (WorkerPool<MockInvoker>, Arc<Probe>) {
    let probe = Probe::new();
    let pool = WorkerPool::new(pool_size, MockInvoker { probe: Arc::clone(&probe) });
    (pool, probe)
}

#[tokio::test(start_paused = true)]
async fn empty_run_resolves_immediately() {
    let (pool, probe) = mock_pool(2);
    let results = pool.run(Vec::new()).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(probe.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn results_follow_submission_order() {
    let (pool, _probe) = mock_pool(3);
    let tasks = vec![task(0, 30), task(1, 20), task(2, 10), task(3, 5), task(4, 1)];
    let results = pool.run(tasks).await.unwrap();
    assert_eq!(results, vec![0, 10, 20, 30, 40]);
}

#[tokio::test(start_paused = true)]
async fn two_workers_four_tasks_schedule() {
    let (pool, probe) = mock_pool(2);
    let tasks = vec![task(0, 10), task(1, 5), task(2, 1), task(3, 1)];

    let results = pool.run(tasks).await.unwrap();
    assert_eq!(results, vec![0, 10, 20, 30]);

    let starts: Vec<(u32, u64)> = probe.starts().iter().map(|s| (s.value, s.at_ms)).collect();
    // 0 and 1 start at once, 2 takes task 1's worker, 3 takes task 2's.
    assert_eq!(starts, vec![(0, 0), (1, 0), (2, 5), (3, 6)]);
    assert_eq!(probe.created(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_pool_size() {
    let (pool, probe) = mock_pool(3);
    let first: Vec<_> = (0..10).map(|i| task(i, 1 + (i as u64 * 7) % 13)).collect();
    let second: Vec<_> = (10..18).map(|i| task(i, 1 + (i as u64 * 5) % 11)).collect();

    let a = pool.submit(first, None);
    let b = pool.submit(second, None);
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a.unwrap(), (0..10).map(|i| i * 10).collect::<Vec<_>>());
    assert_eq!(b.unwrap(), (10..18).map(|i| i * 10).collect::<Vec<_>>());
    assert_eq!(probe.max_in_flight(), 3);
    assert!(probe.created() <= 3);
}

#[tokio::test(start_paused = true)]
async fn most_recently_returned_worker_is_reused() {
    let (pool, probe) = mock_pool(2);
    // task 0 runs on worker 0 and returns first, task 1 on worker 1 returns last
    pool.run(vec![task(0, 5), task(1, 10)]).await.unwrap();
    pool.run(vec![task(2, 1)]).await.unwrap();

    let last = probe.starts().last().copied().unwrap();
    assert_eq!(last.value, 2);
    assert_eq!(last.worker, 1);
    assert_eq!(probe.created(), 2);
}

#[tokio::test(start_paused = true)]
async fn progress_reported_once_per_task() {
    let (pool, _probe) = mock_pool(2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let handle = pool.submit(
        vec![task(0, 4), task(1, 2), task(2, 3), task(3, 1)],
        Some(Box::new(move |done: usize, total: usize| sink.lock().unwrap().push((done, total)))),
    );
    handle.await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
}

#[tokio::test(start_paused = true)]
async fn invocation_failure_rejects_run() {
    let (pool, probe) = mock_pool(1);
    let err = pool
        .run(vec![task(0, 1), failing(1, 1), task(2, 1)])
        .await
        .unwrap_err();

    match err {
        PoolError::Invocation { task, source } => {
            assert_eq!(task, 1);
            assert!(source.to_string().contains("crashed on task 1"));
        }
        other => panic!("expected invocation failure, got {other:?}"),
    }
    // task 2 was never dispatched
    assert_eq!(probe.started_values(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn failed_worker_slot_is_replaced() {
    let (pool, probe) = mock_pool(1);
    assert!(pool.run(vec![failing(0, 1)]).await.is_err());

    // capacity survives the failure; a fresh worker is created
    let results = pool.run(vec![task(1, 1), task(2, 1)]).await.unwrap();
    assert_eq!(results, vec![10, 20]);
    assert_eq!(probe.created(), 2);
    assert_eq!(pool.metrics().tasks_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn failure_leaves_sibling_runs_alone() {
    let (pool, _probe) = mock_pool(2);
    let doomed = pool.submit(vec![failing(0, 1), task(1, 20)], None);
    let healthy = pool.submit(vec![task(2, 5), task(3, 5)], None);

    assert!(doomed.await.is_err());
    assert_eq!(healthy.await.unwrap(), vec![20, 30]);
}

#[tokio::test(start_paused = true)]
async fn late_failure_after_settlement_keeps_capacity() {
    let (pool, probe) = mock_pool(2);
    let err = pool
        .run(vec![failing(0, 1), failing(1, 5)])
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Invocation { task: 0, .. }));

    // the second failure lands on the already settled run
    tokio::time::sleep(Duration::from_millis(10)).await;
    probe.max_in_flight.store(0, Ordering::SeqCst);

    let results = pool.run(vec![task(2, 3), task(3, 3)]).await.unwrap();
    assert_eq!(results, vec![20, 30]);
    assert_eq!(probe.max_in_flight(), 2);
    // both failed slots came back vacant
    assert_eq!(probe.created(), 4);

    let metrics = pool.metrics();
    assert_eq!(metrics.tasks_failed, 2);
    assert_eq!(metrics.runs_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn panicking_progress_rejects_only_its_run() {
    let (pool, probe) = mock_pool(2);
    let sibling = pool.submit(vec![task(9, 50)], None);
    let broken = pool.submit(
        vec![task(0, 5), task(1, 5), task(2, 5)],
        Some(Box::new(|done: usize, _total: usize| {
            if done == 1 {
                panic!("progress sink closed");
            }
        })),
    );

    let err = broken.await.unwrap_err();
    assert!(matches!(err, PoolError::Progress { completed: 1 }));
    assert_eq!(sibling.await.unwrap(), vec![90]);

    // the pool keeps serving new runs
    assert_eq!(pool.run(vec![task(3, 1)]).await.unwrap(), vec![30]);
    assert_eq!(probe.started_values(), vec![9, 0, 3]);
    assert_eq!(pool.metrics().runs_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_before_dispatch_never_invokes() {
    let (pool, probe) = mock_pool(1);
    let busy = pool.submit(vec![task(0, 100)], None);
    let waiting = pool.submit(vec![task(1, 1), task(2, 1), task(3, 1)], None);
    pool.cancel(waiting.id());

    assert!(waiting.await.unwrap_err().is_canceled());
    assert_eq!(busy.await.unwrap(), vec![0]);
    assert_eq!(probe.started_values(), vec![0]);
    assert_eq!(pool.metrics().runs_canceled, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_lets_running_tasks_finish() {
    let (pool, probe) = mock_pool(2);
    let handle = pool.submit((0..5).map(|i| task(i, 10)).collect(), None);
    pool.cancel(handle.id());

    assert!(handle.await.unwrap_err().is_canceled());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(probe.started_values(), vec![0, 1]);
    assert_eq!(probe.finished(), 2);

    // first completion settles the run, the second is discarded
    let metrics = pool.metrics();
    assert_eq!(metrics.tasks_completed, 2);
    assert_eq!(metrics.tasks_discarded, 1);
    assert_eq!(metrics.busy_workers, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_with_everything_running_still_rejects() {
    let (pool, probe) = mock_pool(2);
    let handle = pool.submit(vec![task(0, 5), task(1, 5)], None);
    pool.cancel(handle.id());

    assert!(handle.await.unwrap_err().is_canceled());
    assert_eq!(probe.finished(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_from_progress_callback() {
    let (pool, probe) = mock_pool(1);
    let pool = Arc::new(pool);
    let canceler = Arc::clone(&pool);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let handle = pool.submit(
        (0..4).map(|i| task(i, 10)).collect(),
        Some(Box::new(move |done: usize, total: usize| {
            sink.lock().unwrap().push((done, total));
            if done == 1 {
                canceler.cancel(RunId::new(0));
            }
        })),
    );

    assert!(handle.await.unwrap_err().is_canceled());
    // task 1 was already dispatched when the cancel arrived
    assert_eq!(probe.started_values(), vec![0, 1]);
    assert_eq!(*seen.lock().unwrap(), vec![(1, 4), (2, 4)]);
}

#[tokio::test(start_paused = true)]
async fn cancel_after_settlement_is_noop() {
    let (pool, _probe) = mock_pool(1);
    let handle = pool.submit(vec![task(0, 1)], None);
    let id = handle.id();
    assert_eq!(handle.await.unwrap(), vec![0]);

    pool.cancel(id);
    pool.cancel(id);
    assert_eq!(pool.run(vec![task(1, 1)]).await.unwrap(), vec![10]);
    assert_eq!(pool.metrics().runs_canceled, 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_polls_until_free() {
    let (pool, probe) = mock_pool(1);
    let hog = pool.submit(vec![task(0, 120)], None);
    let late = pool.submit(vec![task(1, 1)], None);

    assert_eq!(late.await.unwrap(), vec![10]);
    assert_eq!(hog.await.unwrap(), vec![0]);

    let start = probe.starts()[1];
    assert_eq!(start.value, 1);
    // retries at 50 and 100 find no worker, the one at 150 does
    assert_eq!(start.at_ms, 150);
    assert_eq!(pool.metrics().retries_scheduled, 3);
}

#[tokio::test(start_paused = true)]
async fn queued_tasks_wait_behind_pending_retry() {
    let (pool, probe) = mock_pool(1);
    let hog = pool.submit(vec![task(0, 30)], None);
    let late = pool.submit(vec![task(1, 1), task(2, 1), task(3, 1)], None);

    assert_eq!(late.await.unwrap(), vec![10, 20, 30]);
    hog.await.unwrap();
    assert_eq!(probe.started_values(), vec![0, 1, 2, 3]);
    // only the first task of the late run needed a retry
    assert_eq!(pool.metrics().retries_scheduled, 1);
}

#[tokio::test(start_paused = true)]
async fn terminate_all_disposes_idle_workers() {
    let (pool, probe) = mock_pool(2);
    pool.run(vec![task(0, 1), task(1, 1)]).await.unwrap();
    assert_eq!(probe.created(), 2);

    pool.terminate_all();
    // an empty run is a barrier behind the terminate command
    pool.run(Vec::new()).await.unwrap();
    assert_eq!(probe.terminated(), 2);
    assert_eq!(pool.metrics().workers_terminated, 2);

    pool.run(vec![task(2, 1)]).await.unwrap();
    assert_eq!(probe.created(), 3);
}

#[tokio::test(start_paused = true)]
async fn terminate_all_skips_busy_workers() {
    let (pool, probe) = mock_pool(2);
    let handle = pool.submit(vec![task(0, 10)], None);
    pool.terminate_all();

    assert_eq!(handle.await.unwrap(), vec![0]);
    assert_eq!(probe.terminated(), 0);

    // the busy worker came back to the pool afterwards
    pool.run(vec![task(1, 1)]).await.unwrap();
    assert_eq!(probe.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_pool_terminates_workers() {
    let (pool, probe) = mock_pool(2);
    let handle = pool.submit(vec![task(0, 5), task(1, 5)], None);
    drop(pool);

    // in-flight runs still settle after the handle is gone
    assert_eq!(handle.await.unwrap(), vec![0, 10]);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(probe.terminated(), 2);
}

#[tokio::test(start_paused = true)]
async fn dropped_run_handle_keeps_running() {
    let (pool, probe) = mock_pool(1);
    drop(pool.submit(vec![task(0, 5), task(1, 5)], None));

    pool.run(vec![task(2, 1)]).await.unwrap();
    assert_eq!(probe.started_values(), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn zero_capacity_pool_never_dispatches() {
    let (pool, probe) = mock_pool(0);
    assert!(pool.run(Vec::new()).await.unwrap().is_empty());

    let stuck = pool.submit(vec![task(0, 1)], None);
    let waited = tokio::time::timeout(Duration::from_secs(1), stuck).await;
    assert!(waited.is_err());
    assert_eq!(probe.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn run_ids_are_sequential() {
    let (pool, _probe) = mock_pool(1);
    let a = pool.submit(Vec::new(), None);
    let b = pool.submit(Vec::new(), None);
    assert_eq!(a.id().index(), 0);
    assert_eq!(b.id().index(), 1);
    a.await.unwrap();
    b.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn metrics_track_run_outcomes() {
    let (pool, _probe) = mock_pool(2);
    pool.run(vec![task(0, 1)]).await.unwrap();
    let _ = pool.run(vec![failing(1, 1)]).await;
    let canceled = pool.submit(vec![task(2, 1)], None);
    pool.cancel(canceled.id());
    let _ = canceled.await;

    let m = pool.metrics();
    assert_eq!(m.pool_size, 2);
    assert_eq!(m.runs_submitted, 3);
    assert_eq!(m.runs_resolved, 1);
    assert_eq!(m.runs_failed, 1);
    assert_eq!(m.runs_canceled, 1);
    assert_eq!(m.busy_workers, 0);
    assert_eq!(m.worker_utilization, 0.0);
}

#[tokio::test]
async fn from_config_rejects_zero_retry_interval() {
    let config = PoolConfig {
        pool_size: Some(1),
        retry_interval_ms: 0,
    };
    let pool = WorkerPool::from_config(&config, MockInvoker { probe: Probe::new() });
    assert!(matches!(pool, Err(PoolError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn task_durations_follow_runtime_clock() {
    let (pool, _probe) = mock_pool(2);
    pool.run(vec![task(0, 10), task(1, 20)]).await.unwrap();

    let m = pool.metrics();
    assert_eq!(m.tasks_completed, 2);
    assert_eq!(m.avg_task_duration, Duration::from_millis(15));
}
