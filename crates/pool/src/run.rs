use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use tokio::sync::oneshot;

use crate::error::PoolError;

/// Progress callback, invoked with `(completed, total)` after every
/// successful task completion of a run.
pub type ProgressFn = Box<dyn FnMut(usize, usize) + Send>;

/// Channel end that settles a run.
pub(crate) type RunReply<T> = oneshot::Sender<Result<Vec<T>, PoolError>>;

/// Lifecycle phase of a live run. Settled runs are removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunPhase {
    /// Initial submission loop in progress; the run cannot settle yet.
    Accepting,
    /// Tasks are being dispatched, queued, or executed.
    Dispatching,
    /// `cancel` was called; no new dispatch starts.
    Canceled,
}

/// How a run must settle once it has nothing left in flight.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Settlement {
    Resolve,
    Cancel,
}

/// Bookkeeping for one batch submission.
pub(crate) struct RunState<A, T> {
    results: Vec<Option<T>>,
    /// Tasks deferred because no worker was free, in submission order.
    pending: VecDeque<(usize, A)>,
    completed: usize,
    running: usize,
    /// One retry timer at most.
    retry_pending: bool,
    phase: RunPhase,
    progress: Option<ProgressFn>,
    reply: Option<RunReply<T>>,
}

impl<A, T> fmt::Debug for RunState<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunState")
            .field("total", &self.results.len())
            .field("completed", &self.completed)
            .field("running", &self.running)
            .field("pending", &self.pending.len())
            .field("retry_pending", &self.retry_pending)
            .field("phase", &self.phase)
            .finish()
    }
}

impl<A, T> RunState<A, T> {
    pub(crate) fn new(total: usize, progress: Option<ProgressFn>, reply: RunReply<T>) -> Self {
        Self {
            results: std::iter::repeat_with(|| None).take(total).collect(),
            pending: VecDeque::new(),
            completed: 0,
            running: 0,
            retry_pending: false,
            phase: RunPhase::Accepting,
            progress,
            reply: Some(reply),
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.results.len()
    }

    pub(crate) fn completed(&self) -> usize {
        self.completed
    }

    pub(crate) fn running(&self) -> usize {
        self.running
    }

    pub(crate) fn phase(&self) -> RunPhase {
        self.phase
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.phase == RunPhase::Canceled
    }

    pub(crate) fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    /// Leave the submission loop.
    pub(crate) fn finish_accepting(&mut self) {
        if self.phase == RunPhase::Accepting {
            self.phase = RunPhase::Dispatching;
        }
    }

    pub(crate) fn cancel(&mut self) {
        self.phase = RunPhase::Canceled;
    }

    pub(crate) fn task_started(&mut self) {
        self.running += 1;
    }

    /// Record a finished task and report progress.
    ///
    /// A panicking callback is contained here and reported as
    /// [`PoolError::Progress`]; the caller settles only this run with it.
    pub(crate) fn task_completed(&mut self, index: usize, output: T) -> Result<(), PoolError> {
        self.running = self.running.saturating_sub(1);
        if let Some(slot) = self.results.get_mut(index) {
            *slot = Some(output);
        }
        self.completed += 1;

        let (completed, total) = (self.completed, self.total());
        let Some(progress) = self.progress.as_mut() else {
            return Ok(());
        };
        panic::catch_unwind(AssertUnwindSafe(|| progress(completed, total)))
            .map_err(|_| PoolError::Progress { completed })
    }

    pub(crate) fn defer(&mut self, index: usize, args: A) {
        self.pending.push_back((index, args));
    }

    pub(crate) fn next_deferred(&mut self) -> Option<(usize, A)> {
        self.pending.pop_front()
    }

    pub(crate) fn set_retry_pending(&mut self, pending: bool) {
        self.retry_pending = pending;
    }

    /// The terminal check: not accepting, nothing queued, nothing running,
    /// no retry outstanding.
    pub(crate) fn settlement(&self) -> Option<Settlement> {
        let idle = self.phase != RunPhase::Accepting
            && self.pending.is_empty()
            && self.running == 0
            && !self.retry_pending;
        if !idle {
            return None;
        }
        if self.is_canceled() {
            Some(Settlement::Cancel)
        } else {
            Some(Settlement::Resolve)
        }
    }

    /// Consume the run and settle its future.
    pub(crate) fn settle(mut self, outcome: Result<(), PoolError>) {
        let Some(reply) = self.reply.take() else {
            return;
        };
        let message = match outcome {
            Ok(()) => {
                let results: Option<Vec<T>> = self.results.into_iter().collect();
                results.ok_or(PoolError::Shutdown)
            }
            Err(e) => Err(e),
        };
        // The caller may have dropped its handle; the outcome is discarded then.
        let _ = reply.send(message);
    }
}
