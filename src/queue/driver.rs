//! The driver capability set: submission of one forward-model run to some
//! compute substrate, and the opaque per-job handle the queue polls.

use std::io;
use std::path::Path;

use thiserror::Error;

use crate::queue::status::DriverStatus;

/// Option key understood by every driver: maximum number of concurrently
/// running jobs, `0` meaning unlimited.
pub const MAX_RUNNING: &str = "MAX_RUNNING";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },
    #[error("submit failed: {0}")]
    SubmitFailed(String),
}

/// Everything a driver needs to start one job.
#[derive(Debug, Clone, Copy)]
pub struct SubmitSpec<'a> {
    pub job_name: &'a str,
    pub run_cmd: &'a str,
    pub run_path: &'a Path,
    pub argv: &'a [String],
    pub num_cpu: usize,
}

/// Opaque handle to a submitted job. Dropping the handle releases the driver
/// resources; the underlying run is not affected by the drop.
pub trait JobHandle: Send + Sync {
    /// Cached, side-effect-free status of the run.
    fn status(&self) -> DriverStatus;

    /// Best-effort termination.
    fn kill(&self);

    /// Compute host the job landed on, when the backend exposes it.
    fn hostname(&self) -> Option<String> {
        None
    }
}

/// A compute backend able to run forward models. All methods take `&self`;
/// drivers are shared between the manager thread and status queries.
pub trait Driver: Send + Sync {
    /// Starts a job asynchronously and returns its handle.
    fn submit(&self, spec: &SubmitSpec<'_>) -> Result<Box<dyn JobHandle>, DriverError>;

    /// Marks the compute node behind `handle` as unusable for future
    /// submissions. Drivers without host-level scheduling ignore this.
    fn blacklist(&self, handle: &dyn JobHandle) {
        let _ = handle;
    }

    /// Sets a string-typed option; returns false for unknown keys or
    /// unparsable values. Host-list options accumulate across calls.
    fn set_option(&self, key: &str, value: &str) -> bool;

    /// Reads back an option; `None` for unknown keys.
    fn option(&self, key: &str) -> Option<String>;

    /// Convenience accessor for the shared MAX_RUNNING option.
    fn max_running(&self) -> usize {
        self.option(MAX_RUNNING)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}
