//! Concurrent dispatcher for forward-model runs: pluggable drivers, a
//! status-tracked job list and the polling manager loop that drives every
//! registered job to SUCCESS, FAILED or IS_KILLED.

pub mod driver;
pub mod list;
pub mod local;
pub mod manager;
pub mod node;
pub mod slurm;
pub mod status;

use std::path::Path;

pub use driver::{Driver, DriverError, JobHandle, MAX_RUNNING, SubmitSpec};
pub use local::LocalDriver;
pub use manager::{JobQueue, QueueConfig, SubmitOutcome};
pub use node::{Job, JobNode};
pub use slurm::SlurmDriver;
pub use status::{DriverStatus, JobStatus, StatusCounters};

/// Publishes the resolved data directory to forward models through the
/// process environment; spawned jobs inherit it. Set once at startup,
/// before any queue thread is running.
pub fn set_data_root(path: &Path) {
    log::info!("DATA_ROOT = {}", path.display());
    // SAFETY: single-threaded startup; no other thread reads or writes the
    // environment concurrently.
    unsafe {
        std::env::set_var("DATA_ROOT", path);
    }
}
