//! # Master-side supervision.
//!
//! The master process owns the worker pool:
//! - [`core`]: the [`Supervisor`] and its serialized core loop
//! - [`actor`]: one actor per pool slot, launching and replacing workers
//! - [`launcher`]: process creation (re-exec of the current binary)
//! - [`stats`]: the authoritative pool view served by [`monitor`]
//! - [`heartbeat`]: buffering and aggregation of worker heartbeats
//! - [`shutdown`]: signal classification and the registry kill-all sweep

mod actor;
mod builder;
mod core;
mod heartbeat;
mod launcher;
mod monitor;
mod shutdown;
mod stats;

#[cfg(test)]
pub(crate) mod testutil;

pub use builder::SupervisorBuilder;
pub use core::Supervisor;
pub use launcher::{
    is_worker_process, ExecLauncher, Launcher, SpawnedWorker, CONFIG_ENV, ROLE_ENV,
};
pub use stats::{ClusterStats, WorkerRecord, WorkerState};
