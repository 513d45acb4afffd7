//! Bounded worker pool for pipeline jobs.
//!
//! A [`WorkerPool`] owns a fixed number of worker slots and accepts batches of
//! tasks ("runs"). Tasks are handed to free workers in submission order, the
//! overflow waits in a per-run queue, and each run resolves with its outputs
//! aligned to the submitted tasks regardless of completion order. Workers are
//! created, reused and disposed through the [`Invoke`] / [`Worker`] contract.

pub mod config;
pub mod error;
pub mod invoke;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod run;

pub use config::PoolConfig;
pub use error::PoolError;
pub use invoke::{Invocation, Invoke, InvokeFn, Worker, invoke_fn};
pub use metrics::PoolMetrics;
pub use pool::{RunHandle, WorkerPool};
pub use registry::RunId;
pub use run::ProgressFn;
