use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::invoke::Invoke;
use crate::metrics::PoolMetrics;
use crate::registry::RunId;
use crate::run::ProgressFn;

use super::dispatch::{Command, Dispatcher};

/// A fixed-capacity pool of reusable workers.
///
/// All scheduling state lives in a background dispatcher task; this handle
/// only sends commands to it. Must be created inside a tokio runtime.
/// Dropping the handle lets in-flight runs finish, then disposes every
/// pooled worker.
pub struct WorkerPool<I: Invoke> {
    pool_size: usize,
    commands: mpsc::UnboundedSender<Command<I>>,
    /// Next run id. Held while sending `Submit` so ids reach the dispatcher in order.
    next_run: Mutex<usize>,
    metrics: Arc<RwLock<PoolMetrics>>,
}

impl<I: Invoke> WorkerPool<I> {
    /// Create a pool with `pool_size` slots and the default retry interval.
    pub fn new(pool_size: usize, invoker: I) -> Self {
        Self::spawn(pool_size, PoolConfig::default().retry_interval(), invoker)
    }

    /// Create a pool from a config, rejecting invalid settings.
    pub fn from_config(config: &PoolConfig, invoker: I) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self::spawn(
            config.resolved_pool_size(),
            config.retry_interval(),
            invoker,
        ))
    }

    fn spawn(pool_size: usize, retry_interval: Duration, invoker: I) -> Self {
        let metrics = Arc::new(RwLock::new(PoolMetrics::new(pool_size)));
        let (commands, receiver) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(
            pool_size,
            retry_interval,
            Arc::new(invoker),
            commands.clone(),
            Arc::clone(&metrics),
        );
        tokio::spawn(dispatcher.run(receiver));

        info!(pool_size, ?retry_interval, "worker pool created");
        Self {
            pool_size,
            commands,
            next_run: Mutex::new(0),
            metrics,
        }
    }

    /// Submit a batch of tasks.
    ///
    /// Tasks are dispatched in order onto free workers; the rest wait in the
    /// run's queue. The returned handle resolves with one output per task,
    /// aligned with `tasks`, or with the first error. An empty batch resolves
    /// with an empty vector.
    pub fn submit(&self, tasks: Vec<I::Args>, progress: Option<ProgressFn>) -> RunHandle<I::Output> {
        let (reply, receiver) = oneshot::channel();
        let mut next_run = self.next_run.lock().unwrap_or_else(PoisonError::into_inner);
        let id = RunId::new(*next_run);
        *next_run += 1;
        // On failure the reply sender is dropped with the command and the
        // handle resolves to `PoolError::Shutdown`.
        let _ = self.commands.send(Command::Submit {
            run: id,
            tasks,
            progress,
            reply,
        });
        drop(next_run);

        RunHandle { id, receiver }
    }

    /// Submit without progress reporting and wait for the results.
    pub async fn run(&self, tasks: Vec<I::Args>) -> Result<Vec<I::Output>, PoolError> {
        self.submit(tasks, None).await
    }

    /// Stop dispatching the remaining tasks of a run.
    ///
    /// Tasks already handed to a worker run to completion and their outputs
    /// are discarded; the run rejects with [`PoolError::Canceled`]. No-op for
    /// settled runs.
    pub fn cancel(&self, run: RunId) {
        let _ = self.commands.send(Command::Cancel(run));
    }

    /// Dispose every idle pooled worker. Slots become vacant, so the next
    /// task on each asks the invoker for a fresh worker. Busy workers are
    /// left alone.
    pub fn terminate_all(&self) {
        let _ = self.commands.send(Command::TerminateAll);
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Snapshot of the pool metrics as of the last processed command.
    pub fn metrics(&self) -> PoolMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<I: Invoke> Drop for WorkerPool<I> {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Pending result of a submitted run.
///
/// Await it for the ordered outputs. Dropping it does not cancel the run;
/// use [`WorkerPool::cancel`] with [`RunHandle::id`] for that.
#[derive(Debug)]
pub struct RunHandle<T> {
    id: RunId,
    receiver: oneshot::Receiver<Result<Vec<T>, PoolError>>,
}

impl<T> RunHandle<T> {
    pub fn id(&self) -> RunId {
        self.id
    }
}

impl<T> Future for RunHandle<T> {
    type Output = Result<Vec<T>, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PoolError::Shutdown)))
    }
}
