//! Worker invocation contract.
//!
//! The pool never creates or inspects workers itself. It hands an optional
//! worker to an [`Invoke`] implementation together with the task arguments
//! and expects the (possibly new) worker back alongside the task output.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

/// A reusable execution context (thread, process, sandbox, ...).
pub trait Worker: Send + Sized + 'static {
    /// Forcibly dispose of the worker. Called by `terminate_all` and when
    /// the pool shuts down.
    fn terminate(self);
}

/// Successful outcome of one invocation.
///
/// `worker` must always be recyclable. Logical task failures (e.g. a non-zero
/// return code) belong in `output`, not in an `Err`.
#[derive(Debug)]
pub struct Invocation<W, T> {
    pub worker: W,
    pub output: T,
}

impl<W, T> Invocation<W, T> {
    pub fn new(worker: W, output: T) -> Self {
        Self { worker, output }
    }
}

/// Executes one task on one worker.
///
/// `worker` is `None` when the slot has no live worker yet (or its worker was
/// disposed); the implementation must then create one. Return `Err` only when
/// the worker itself is unusable: the pool does not try to recover a worker
/// from a failed invocation and the owning run is rejected.
#[async_trait]
pub trait Invoke: Send + Sync + 'static {
    type Worker: Worker;
    type Args: Send + 'static;
    type Output: Send + 'static;

    async fn invoke(
        &self,
        worker: Option<Self::Worker>,
        args: Self::Args,
    ) -> anyhow::Result<Invocation<Self::Worker, Self::Output>>;
}

/// [`Invoke`] adapter over an async closure. Build with [`invoke_fn`].
pub struct InvokeFn<F, W, A, T> {
    f: F,
    _marker: PhantomData<fn(Option<W>, A) -> T>,
}

/// Wrap an async closure as an invocation contract.
///
/// # Example
/// ```ignore
/// let invoker = invoke_fn(|worker: Option<MyWorker>, path: String| async move {
///     let worker = worker.unwrap_or_else(MyWorker::spawn);
///     let output = worker.convert(&path).await?;
///     Ok(Invocation::new(worker, output))
/// });
/// ```
pub fn invoke_fn<F, Fut, W, A, T>(f: F) -> InvokeFn<F, W, A, T>
where
    F: Fn(Option<W>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Invocation<W, T>>> + Send + 'static,
    W: Worker,
    A: Send + 'static,
    T: Send + 'static,
{
    InvokeFn {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, W, A, T> Invoke for InvokeFn<F, W, A, T>
where
    F: Fn(Option<W>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Invocation<W, T>>> + Send + 'static,
    W: Worker,
    A: Send + 'static,
    T: Send + 'static,
{
    type Worker = W;
    type Args = A;
    type Output = T;

    async fn invoke(&self, worker: Option<W>, args: A) -> anyhow::Result<Invocation<W, T>> {
        (self.f)(worker, args).await
    }
}
