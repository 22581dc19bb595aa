//! Worker pool: N long-lived workers racing to claim tickets.
//!
//! Dispatch is work-stealing by polling: each worker ticks every couple of
//! seconds and, when idle, tries to pop the queue. Because `pop` is
//! serialised, exactly one worker claims any given ticket. Each claimed
//! ticket is driven through the full pipeline (workspace, generation,
//! commit+push, CI, verdict) before the worker returns to idle.

mod pool;
#[allow(clippy::module_inception)]
mod worker;

#[cfg(test)]
mod tests;

pub use pool::{PoolConfig, WorkerPool};
pub use worker::{PipelineError, Worker, WorkerConfig, WorkerSnapshot};
