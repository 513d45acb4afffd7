//! Bounded worker pool -- schedules batches of tasks ("runs") onto a fixed
//! number of reusable workers.
//!
//! Split into focused submodules:
//! - `core`: public `WorkerPool` handle and `RunHandle` future
//! - `dispatch`: the dispatcher event loop owning slots and the run registry

mod core;
mod dispatch;
#[cfg(test)]
mod tests;

pub use self::core::{RunHandle, WorkerPool};
