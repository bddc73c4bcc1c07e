//! One forward-model invocation: its identity, lifecycle status, submit
//! bookkeeping, completion callbacks and the driver handle once submitted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::queue::driver::JobHandle;
use crate::queue::status::JobStatus;

type DoneCallback = Box<dyn Fn() -> bool + Send + Sync>;
type RetryCallback = Box<dyn Fn() -> bool + Send + Sync>;
type ExitCallback = Box<dyn Fn() + Send + Sync>;

/// User-supplied hooks run on terminal driver states. All optional.
#[derive(Default)]
pub struct JobCallbacks {
    pub(crate) done: Option<DoneCallback>,
    pub(crate) retry: Option<RetryCallback>,
    pub(crate) exit: Option<ExitCallback>,
}

/// Description of a job to register with the queue; built fluently and moved
/// into the queue by `add_job`.
pub struct Job {
    pub name: String,
    pub run_cmd: String,
    pub run_path: PathBuf,
    pub argv: Vec<String>,
    pub num_cpu: usize,
    pub callbacks: JobCallbacks,
}

impl Job {
    pub fn new(name: impl Into<String>, run_cmd: impl Into<String>, run_path: &Path) -> Self {
        Self {
            name: name.into(),
            run_cmd: run_cmd.into(),
            run_path: run_path.to_path_buf(),
            argv: Vec::new(),
            num_cpu: 1,
            callbacks: JobCallbacks::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn num_cpu(mut self, num_cpu: usize) -> Self {
        self.num_cpu = num_cpu;
        self
    }

    /// Verification hook run after the driver reports a clean exit and the
    /// file protocol agrees; returns true iff the outputs check out.
    pub fn on_done(mut self, callback: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.callbacks.done = Some(Box::new(callback));
        self
    }

    /// Consulted once the submit budget is exhausted; returns true iff one
    /// more round of attempts is justified.
    pub fn on_retry(mut self, callback: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.callbacks.retry = Some(Box::new(callback));
        self
    }

    /// Terminal cleanup, run right before the job is marked failed.
    pub fn on_exit(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.exit = Some(Box::new(callback));
        self
    }
}

struct Timing {
    sim_start: Option<Instant>,
    sim_end: Option<Instant>,
    /// Last status change; feeds the queue-wide progress timestamp.
    timestamp: Instant,
}

pub struct JobNode {
    name: String,
    run_path: PathBuf,
    run_cmd: String,
    argv: Vec<String>,
    num_cpu: usize,
    ok_file: Option<PathBuf>,
    exit_file: Option<PathBuf>,
    status_file: Option<PathBuf>,
    callbacks: JobCallbacks,
    queue_index: OnceLock<usize>,
    status: Mutex<JobStatus>,
    submit_attempt: AtomicUsize,
    timing: Mutex<Timing>,
    handle: Mutex<Option<Box<dyn JobHandle>>>,
}

impl JobNode {
    /// Creates a node in status [`JobStatus::NotActive`]. The sentinel file
    /// names configured on the queue are resolved against the job's run
    /// path.
    pub fn new(
        job: Job,
        ok_name: Option<&str>,
        status_name: Option<&str>,
        exit_name: Option<&str>,
    ) -> Self {
        let ok_file = ok_name.map(|n| job.run_path.join(n));
        let status_file = status_name.map(|n| job.run_path.join(n));
        let exit_file = exit_name.map(|n| job.run_path.join(n));
        Self {
            ok_file,
            status_file,
            exit_file,
            name: job.name,
            run_path: job.run_path,
            run_cmd: job.run_cmd,
            argv: job.argv,
            num_cpu: job.num_cpu,
            callbacks: job.callbacks,
            queue_index: OnceLock::new(),
            status: Mutex::new(JobStatus::NotActive),
            submit_attempt: AtomicUsize::new(0),
            timing: Mutex::new(Timing {
                sim_start: None,
                sim_end: None,
                timestamp: Instant::now(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_path(&self) -> &Path {
        &self.run_path
    }

    pub fn run_cmd(&self) -> &str {
        &self.run_cmd
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn num_cpu(&self) -> usize {
        self.num_cpu
    }

    pub fn ok_file(&self) -> Option<&Path> {
        self.ok_file.as_deref()
    }

    pub fn exit_file(&self) -> Option<&Path> {
        self.exit_file.as_deref()
    }

    pub fn status_file(&self) -> Option<&Path> {
        self.status_file.as_deref()
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock().expect("job status poisoned")
    }

    pub(crate) fn status_slot(&self) -> &Mutex<JobStatus> {
        &self.status
    }

    pub(crate) fn set_queue_index(&self, index: usize) {
        let _ = self.queue_index.set(index);
    }

    pub fn queue_index(&self) -> Option<usize> {
        self.queue_index.get().copied()
    }

    pub fn submit_attempt(&self) -> usize {
        self.submit_attempt.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_submit_attempt(&self) -> usize {
        self.submit_attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Node-failure retries do not consume the submit budget.
    pub(crate) fn dec_submit_attempt(&self) {
        let _ = self
            .submit_attempt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub(crate) fn reset_submit_attempt(&self) {
        self.submit_attempt.store(0, Ordering::SeqCst);
    }

    pub fn sim_start(&self) -> Option<Instant> {
        self.timing.lock().expect("job timing poisoned").sim_start
    }

    pub fn sim_end(&self) -> Option<Instant> {
        self.timing.lock().expect("job timing poisoned").sim_end
    }

    /// Instant of the last status change.
    pub fn timestamp(&self) -> Instant {
        self.timing.lock().expect("job timing poisoned").timestamp
    }

    /// Called by the transition primitive after a status swap.
    pub(crate) fn note_status_change(&self, to: JobStatus) {
        let now = Instant::now();
        let mut timing = self.timing.lock().expect("job timing poisoned");
        timing.timestamp = now;
        match to {
            JobStatus::Submitted => timing.sim_start = Some(now),
            JobStatus::Done | JobStatus::Exit => timing.sim_end = Some(now),
            _ => {}
        }
    }

    pub(crate) fn set_handle(&self, handle: Box<dyn JobHandle>) {
        *self.handle.lock().expect("job handle poisoned") = Some(handle);
    }

    /// Releases the driver resources once the run has reached a settled
    /// state.
    pub(crate) fn free_handle(&self) {
        self.handle.lock().expect("job handle poisoned").take();
    }

    /// Runs `f` against the driver handle, if any.
    pub(crate) fn with_handle<T>(&self, f: impl FnOnce(&dyn JobHandle) -> T) -> Option<T> {
        let guard = self.handle.lock().expect("job handle poisoned");
        guard.as_deref().map(f)
    }

    pub(crate) fn run_done_callback(&self) -> bool {
        self.callbacks.done.as_ref().map_or(true, |f| f())
    }

    pub(crate) fn run_retry_callback(&self) -> bool {
        self.callbacks.retry.as_ref().map_or(false, |f| f())
    }

    pub(crate) fn run_exit_callback(&self) {
        if let Some(f) = self.callbacks.exit.as_ref() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn builder_collects_arguments_and_callbacks() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_in_cb = Arc::clone(&fired);
        let job = Job::new("fm", "/usr/bin/env", Path::new("/tmp/run"))
            .arg("one")
            .args(["two", "three"])
            .num_cpu(4)
            .on_done(move || {
                fired_in_cb.store(true, Ordering::SeqCst);
                true
            });
        let node = JobNode::new(job, Some("OK"), None, Some("ERROR"));

        assert_eq!(node.name(), "fm");
        assert_eq!(node.argv(), ["one", "two", "three"]);
        assert_eq!(node.num_cpu(), 4);
        assert_eq!(node.ok_file(), Some(Path::new("/tmp/run/OK")));
        assert_eq!(node.exit_file(), Some(Path::new("/tmp/run/ERROR")));
        assert_eq!(node.status_file(), None);
        assert_eq!(node.status(), JobStatus::NotActive);

        assert!(node.run_done_callback());
        assert!(fired.load(Ordering::SeqCst));
        // No retry callback: retrying is not justified.
        assert!(!node.run_retry_callback());
    }

    #[test]
    fn submit_attempt_arithmetic_saturates_at_zero() {
        let node = JobNode::new(Job::new("n", "true", Path::new(".")), None, None, None);
        assert_eq!(node.submit_attempt(), 0);
        node.dec_submit_attempt();
        assert_eq!(node.submit_attempt(), 0);
        assert_eq!(node.inc_submit_attempt(), 1);
        assert_eq!(node.inc_submit_attempt(), 2);
        node.dec_submit_attempt();
        assert_eq!(node.submit_attempt(), 1);
        node.reset_submit_attempt();
        assert_eq!(node.submit_attempt(), 0);
    }

    #[test]
    fn timing_follows_status_changes() {
        let node = JobNode::new(Job::new("n", "true", Path::new(".")), None, None, None);
        assert!(node.sim_start().is_none());
        node.note_status_change(JobStatus::Submitted);
        assert!(node.sim_start().is_some());
        assert!(node.sim_end().is_none());
        node.note_status_change(JobStatus::Done);
        assert!(node.sim_end().is_some());
    }
}
