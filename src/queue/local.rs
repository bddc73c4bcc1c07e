//! Local driver: runs forward models as child processes of this host. Each
//! submit spawns the command and hands the child to a monitor thread whose
//! `wait()` result becomes the job status; the monitor thread itself is the
//! completion signal.

use std::collections::HashMap;
use std::process::Command;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::queue::driver::{Driver, DriverError, JobHandle, MAX_RUNNING, SubmitSpec};
use crate::queue::status::DriverStatus;

struct LocalJobState {
    status: Mutex<DriverStatus>,
    pid: AtomicI32,
}

pub struct LocalHandle {
    state: Arc<LocalJobState>,
}

impl JobHandle for LocalHandle {
    fn status(&self) -> DriverStatus {
        *self.state.status.lock().expect("local job state poisoned")
    }

    fn kill(&self) {
        let pid = self.state.pid.load(Ordering::SeqCst);
        if pid > 0 {
            // SAFETY: plain signal delivery to a process we spawned.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
}

#[derive(Default)]
pub struct LocalDriver {
    /// Serializes spawn + monitor-thread creation across concurrent submits.
    submit_lock: Mutex<()>,
    options: Mutex<HashMap<String, String>>,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Driver for LocalDriver {
    fn submit(&self, spec: &SubmitSpec<'_>) -> Result<Box<dyn JobHandle>, DriverError> {
        let _guard = self.submit_lock.lock().expect("submit lock poisoned");

        let mut command = Command::new(spec.run_cmd);
        command.args(spec.argv).current_dir(spec.run_path);
        let mut child = command.spawn().map_err(|source| DriverError::Spawn {
            cmd: spec.run_cmd.to_string(),
            source,
        })?;

        let state = Arc::new(LocalJobState {
            status: Mutex::new(DriverStatus::Running),
            pid: AtomicI32::new(child.id() as i32),
        });

        let monitor_state = Arc::clone(&state);
        thread::Builder::new()
            .name(format!("local-wait-{}", spec.job_name))
            .spawn(move || {
                let result = child.wait();
                let status = match result {
                    Ok(exit) if exit.success() => DriverStatus::Done,
                    _ => DriverStatus::Exit,
                };
                *monitor_state
                    .status
                    .lock()
                    .expect("local job state poisoned") = status;
            })
            .map_err(|source| DriverError::Spawn {
                cmd: spec.run_cmd.to_string(),
                source,
            })?;

        log::debug!(
            "submitted {} (pid {}) in {}",
            spec.job_name,
            state.pid.load(Ordering::SeqCst),
            spec.run_path.display()
        );
        Ok(Box::new(LocalHandle { state }))
    }

    fn set_option(&self, key: &str, value: &str) -> bool {
        if key != MAX_RUNNING || value.parse::<usize>().is_err() {
            return false;
        }
        self.options
            .lock()
            .expect("local options poisoned")
            .insert(key.to_string(), value.to_string());
        true
    }

    fn option(&self, key: &str) -> Option<String> {
        self.options
            .lock()
            .expect("local options poisoned")
            .get(key)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn wait_settled(handle: &dyn JobHandle, timeout: Duration) -> DriverStatus {
        let deadline = Instant::now() + timeout;
        loop {
            let status = handle.status();
            if status != DriverStatus::Running || Instant::now() > deadline {
                return status;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn clean_exit_reports_done() {
        let driver = LocalDriver::new();
        let spec = SubmitSpec {
            job_name: "ok",
            run_cmd: "true",
            run_path: Path::new("."),
            argv: &[],
            num_cpu: 1,
        };
        let handle = driver.submit(&spec).unwrap();
        assert_eq!(
            wait_settled(handle.as_ref(), Duration::from_secs(5)),
            DriverStatus::Done
        );
    }

    #[test]
    fn nonzero_exit_reports_exit() {
        let driver = LocalDriver::new();
        let spec = SubmitSpec {
            job_name: "fail",
            run_cmd: "false",
            run_path: Path::new("."),
            argv: &[],
            num_cpu: 1,
        };
        let handle = driver.submit(&spec).unwrap();
        assert_eq!(
            wait_settled(handle.as_ref(), Duration::from_secs(5)),
            DriverStatus::Exit
        );
    }

    #[test]
    fn missing_binary_is_a_submit_error() {
        let driver = LocalDriver::new();
        let spec = SubmitSpec {
            job_name: "missing",
            run_cmd: "/nonexistent/forward-model",
            run_path: Path::new("."),
            argv: &[],
            num_cpu: 1,
        };
        assert!(matches!(
            driver.submit(&spec),
            Err(DriverError::Spawn { .. })
        ));
    }

    #[test]
    fn kill_terminates_a_sleeping_job() {
        let driver = LocalDriver::new();
        let argv = vec!["30".to_string()];
        let spec = SubmitSpec {
            job_name: "sleeper",
            run_cmd: "sleep",
            run_path: Path::new("."),
            argv: &argv,
            num_cpu: 1,
        };
        let handle = driver.submit(&spec).unwrap();
        handle.kill();
        assert_eq!(
            wait_settled(handle.as_ref(), Duration::from_secs(5)),
            DriverStatus::Exit
        );
    }

    #[test]
    fn max_running_option_round_trips() {
        let driver = LocalDriver::new();
        assert!(driver.set_option(MAX_RUNNING, "4"));
        assert_eq!(driver.option(MAX_RUNNING).as_deref(), Some("4"));
        assert_eq!(driver.max_running(), 4);
        assert!(!driver.set_option(MAX_RUNNING, "many"));
        assert!(!driver.set_option("PARTITION", "foo"));
        assert!(driver.option("PARTITION").is_none());
    }
}
