use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::PoolError;
use crate::invoke::{Invocation, Invoke, Worker};
use crate::metrics::PoolMetrics;
use crate::registry::{RunId, RunRegistry};
use crate::run::{ProgressFn, RunReply, RunState, Settlement};

/// Message sent to the dispatcher, from the pool handle, from finished
/// invocations, and from retry timers.
pub(crate) enum Command<I: Invoke> {
    Submit {
        run: RunId,
        tasks: Vec<I::Args>,
        progress: Option<ProgressFn>,
        reply: RunReply<I::Output>,
    },
    Completed {
        run: RunId,
        task: usize,
        outcome: anyhow::Result<Invocation<I::Worker, I::Output>>,
        elapsed: Duration,
    },
    Retry {
        run: RunId,
        task: usize,
        args: I::Args,
    },
    Cancel(RunId),
    TerminateAll,
    /// The last pool handle was dropped.
    Close,
}

/// One unit of pool capacity.
enum WorkerSlot<W> {
    /// No live worker; the invoker creates one on next use.
    Vacant,
    Ready(W),
}

impl<W> WorkerSlot<W> {
    fn into_worker(self) -> Option<W> {
        match self {
            WorkerSlot::Vacant => None,
            WorkerSlot::Ready(worker) => Some(worker),
        }
    }
}

/// Owns the slot stack and the run registry. Every mutation happens inside
/// one command handler, so bookkeeping never interleaves.
pub(crate) struct Dispatcher<I: Invoke> {
    pool_size: usize,
    retry_interval: Duration,
    invoker: Arc<I>,
    /// LIFO: the most recently returned worker is reused first.
    slots: Vec<WorkerSlot<I::Worker>>,
    /// Slots currently handed to an invocation.
    busy: usize,
    runs: RunRegistry<RunState<I::Args, I::Output>>,
    commands: mpsc::UnboundedSender<Command<I>>,
    metrics: PoolMetrics,
    shared_metrics: Arc<RwLock<PoolMetrics>>,
    closing: bool,
}

impl<I: Invoke> Dispatcher<I> {
    pub(crate) fn new(
        pool_size: usize,
        retry_interval: Duration,
        invoker: Arc<I>,
        commands: mpsc::UnboundedSender<Command<I>>,
        shared_metrics: Arc<RwLock<PoolMetrics>>,
    ) -> Self {
        Self {
            pool_size,
            retry_interval,
            invoker,
            slots: (0..pool_size).map(|_| WorkerSlot::Vacant).collect(),
            busy: 0,
            runs: RunRegistry::default(),
            commands,
            metrics: PoolMetrics::new(pool_size),
            shared_metrics,
            closing: false,
        }
    }

    /// Process commands until the pool is closed and nothing is left in flight.
    pub(crate) async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command<I>>) {
        while let Some(command) = receiver.recv().await {
            self.handle(command);
            debug_assert_eq!(self.slots.len() + self.busy, self.pool_size);
            self.publish_metrics();

            if self.closing && self.runs.live() == 0 && self.busy == 0 {
                break;
            }
        }

        self.terminate_all();
        self.publish_metrics();
        info!(runs = self.runs.len(), "worker pool stopped");
    }

    fn handle(&mut self, command: Command<I>) {
        match command {
            Command::Submit {
                run,
                tasks,
                progress,
                reply,
            } => self.submit(run, tasks, progress, reply),
            Command::Completed {
                run,
                task,
                outcome,
                elapsed,
            } => self.complete(run, task, outcome, elapsed),
            Command::Retry { run, task, args } => self.retry(run, task, args),
            Command::Cancel(run) => self.cancel(run),
            Command::TerminateAll => self.terminate_all(),
            Command::Close => {
                debug!(live = ?self.runs.live_ids(), busy = self.busy, "worker pool closing");
                self.closing = true;
            }
        }
    }

    fn submit(
        &mut self,
        run: RunId,
        tasks: Vec<I::Args>,
        progress: Option<ProgressFn>,
        reply: RunReply<I::Output>,
    ) {
        let total = tasks.len();
        let id = self.runs.insert(RunState::new(total, progress, reply));
        debug_assert_eq!(id, run, "run ids must follow submission order");
        self.metrics.runs_submitted += 1;
        info!(run = %id, tasks = total, "run submitted");

        for (task, args) in tasks.into_iter().enumerate() {
            self.dispatch(id, task, args);
        }

        if let Some(state) = self.runs.get_mut(id) {
            state.finish_accepting();
        }
        self.try_settle(id);
    }

    /// Hand a task to a free worker, or defer it.
    fn dispatch(&mut self, run: RunId, task: usize, args: I::Args) {
        let Some(state) = self.runs.get_mut(run) else {
            trace!(run = %run, task, "dispatch for settled run ignored");
            return;
        };

        if state.is_canceled() {
            self.settle(run, Err(PoolError::Canceled));
            return;
        }

        if let Some(slot) = self.slots.pop() {
            state.task_started();
            self.start(run, task, slot, args);
        } else if state.running() > 0 || state.retry_pending() {
            // A running task of this run picks it up when its worker returns.
            trace!(run = %run, task, "no free worker, task queued");
            state.defer(task, args);
        } else {
            // Every worker belongs to other runs.
            state.set_retry_pending(true);
            self.schedule_retry(run, task, args);
        }
    }

    fn start(&mut self, run: RunId, task: usize, slot: WorkerSlot<I::Worker>, args: I::Args) {
        self.busy += 1;
        self.metrics.set_busy(self.busy);

        let worker = slot.into_worker();
        debug!(run = %run, task, reuse = worker.is_some(), "task dispatched");

        let invoker = Arc::clone(&self.invoker);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let invocation = tokio::spawn(async move { invoker.invoke(worker, args).await });
            let outcome = match invocation.await {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow::anyhow!("invocation aborted: {e}")),
            };
            let _ = commands.send(Command::Completed {
                run,
                task,
                outcome,
                elapsed: started.elapsed(),
            });
        });
    }

    fn complete(
        &mut self,
        run: RunId,
        task: usize,
        outcome: anyhow::Result<Invocation<I::Worker, I::Output>>,
        elapsed: Duration,
    ) {
        self.busy = self.busy.saturating_sub(1);
        self.metrics.set_busy(self.busy);

        match outcome {
            Ok(Invocation { worker, output }) => {
                self.slots.push(WorkerSlot::Ready(worker));
                self.metrics.record_completion(elapsed);

                let Some(state) = self.runs.get_mut(run) else {
                    self.metrics.tasks_discarded += 1;
                    trace!(run = %run, task, "completion for settled run discarded");
                    return;
                };

                if let Err(e) = state.task_completed(task, output) {
                    self.settle(run, Err(e));
                    return;
                }
                debug!(
                    run = %run,
                    task,
                    completed = state.completed(),
                    total = state.total(),
                    ?elapsed,
                    "task completed"
                );

                // The run's own backlog gets the worker that was just returned.
                match state.next_deferred() {
                    Some((next, args)) => self.dispatch(run, next, args),
                    None => self.try_settle(run),
                }
            }
            Err(source) => {
                // The worker is gone; keep the capacity as a vacant slot.
                self.slots.push(WorkerSlot::Vacant);
                self.metrics.tasks_failed += 1;

                if self.runs.contains(run) {
                    self.settle(run, Err(PoolError::Invocation { task, source }));
                } else {
                    trace!(run = %run, task, error = %source, "failure for settled run discarded");
                }
            }
        }
    }

    fn schedule_retry(&mut self, run: RunId, task: usize, args: I::Args) {
        self.metrics.retries_scheduled += 1;
        debug!(run = %run, task, interval = ?self.retry_interval, "pool exhausted, retry scheduled");

        let commands = self.commands.clone();
        let interval = self.retry_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = commands.send(Command::Retry { run, task, args });
        });
    }

    fn retry(&mut self, run: RunId, task: usize, args: I::Args) {
        if let Some(state) = self.runs.get_mut(run) {
            state.set_retry_pending(false);
        }
        self.dispatch(run, task, args);
    }

    fn cancel(&mut self, run: RunId) {
        match self.runs.get_mut(run) {
            Some(state) => {
                state.cancel();
                debug!(run = %run, phase = ?state.phase(), running = state.running(), "run marked canceled");
            }
            None => trace!(run = %run, "cancel for settled run ignored"),
        }
    }

    /// Dispose every pooled worker and reset its slot.
    fn terminate_all(&mut self) {
        let mut disposed = 0u64;
        for slot in self.slots.iter_mut() {
            if let WorkerSlot::Ready(worker) = std::mem::replace(slot, WorkerSlot::Vacant) {
                worker.terminate();
                disposed += 1;
            }
        }
        self.metrics.workers_terminated += disposed;
        info!(disposed, busy = self.busy, "pooled workers terminated");
    }

    fn try_settle(&mut self, run: RunId) {
        let Some(settlement) = self.runs.get_mut(run).and_then(|state| state.settlement()) else {
            return;
        };
        match settlement {
            Settlement::Resolve => self.settle(run, Ok(())),
            Settlement::Cancel => self.settle(run, Err(PoolError::Canceled)),
        }
    }

    /// Clear the registry entry and settle the run's future. Runs once per run.
    fn settle(&mut self, run: RunId, outcome: Result<(), PoolError>) {
        let Some(state) = self.runs.clear(run) else {
            return;
        };

        match &outcome {
            Ok(()) => {
                self.metrics.runs_resolved += 1;
                info!(run = %run, tasks = state.total(), "run resolved");
            }
            Err(PoolError::Canceled) => {
                self.metrics.runs_canceled += 1;
                info!(
                    run = %run,
                    completed = state.completed(),
                    total = state.total(),
                    "run canceled"
                );
            }
            Err(e) => {
                self.metrics.runs_failed += 1;
                warn!(run = %run, error = %e, "run failed");
            }
        }

        state.settle(outcome);
    }

    fn publish_metrics(&self) {
        let mut shared = self
            .shared_metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *shared = self.metrics.clone();
    }
}
