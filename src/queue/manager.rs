//! The job queue manager: registration, the polling main loop, the submit
//! policy, terminal-state handlers and the bounded completion-callback
//! executor.
//!
//! Exactly one thread runs [`JobQueue::run_jobs`]; other threads may
//! concurrently register jobs, query statuses, kill individual jobs or
//! request a user exit. Status reads outside the manager may be stale by one
//! poll interval.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::queue::driver::{Driver, SubmitSpec};
use crate::queue::list::JobList;
use crate::queue::node::{Job, JobNode};
use crate::queue::status::{DriverStatus, JobStatus, StatusCounters};

/// Upper bound on submissions per loop iteration, so status updates stay
/// fresh while a large ensemble drains into the driver.
const MAX_SUBMIT_PER_ITERATION: usize = 5;

/// Sleep slice while polling for the ok-file.
const OK_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Submit attempts granted to each job before its retry callback is
    /// consulted.
    pub max_submit: usize,
    /// How long to wait for the ok-file after a clean driver exit.
    pub max_ok_wait: Duration,
    /// Base sleep between queue iterations; backs off adaptively to eight
    /// times this value while nothing changes.
    pub poll_interval: Duration,
    /// Name of the success sentinel file, resolved against each job's run
    /// path. `None` disables the ok-file protocol.
    pub ok_file: Option<String>,
    /// Name of the progress sentinel; when configured but never created, the
    /// ok-file wait is skipped.
    pub status_file: Option<String>,
    /// Name of the failure sentinel; its existence is a definite failure.
    pub exit_file: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_submit: 2,
            max_ok_wait: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            ok_file: None,
            status_file: None,
            exit_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    /// The queue is paused or shutting down; try again later.
    QueueClosed,
    /// The driver refused the job; it stays WAITING for the next iteration.
    DriverFail,
}

struct QueueCore {
    driver: Arc<dyn Driver>,
    list: JobList,
    counters: StatusCounters,
    config: QueueConfig,
    open: AtomicBool,
    user_exit: AtomicBool,
    running: AtomicBool,
    pause_on: AtomicBool,
    submit_complete: AtomicBool,
    /// Seconds; zero means unlimited.
    max_duration_secs: AtomicU64,
    stop_time: Mutex<Option<Instant>>,
    progress_timestamp: Mutex<Instant>,
}

enum HandlerKind {
    Done,
    Exit,
}

struct HandlerTask {
    node: Arc<JobNode>,
    kind: HandlerKind,
}

/// Runs terminal-state callbacks off the manager thread. A single worker and
/// an in-flight count of at most one bound the memory the callbacks can
/// hold; handler dispatch is skipped, never blocked, while busy.
struct CallbackExecutor {
    tx: Option<Sender<HandlerTask>>,
    in_flight: Arc<AtomicUsize>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CallbackExecutor {
    fn new(core: Arc<QueueCore>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<HandlerTask>();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let worker_count = Arc::clone(&in_flight);
        let worker = thread::Builder::new()
            .name("queue-callbacks".to_string())
            .spawn(move || {
                for task in rx {
                    match task.kind {
                        HandlerKind::Done => run_done_handler(&core, &task.node),
                        HandlerKind::Exit => run_exit_handler(&core, &task.node),
                    }
                    worker_count.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .expect("failed to spawn the callback worker");
        Self {
            tx: Some(tx),
            in_flight,
            worker: Some(worker),
        }
    }

    fn idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }

    fn dispatch(&self, node: Arc<JobNode>, kind: HandlerKind) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = &self.tx {
            if tx.send(HandlerTask { node, kind }).is_err() {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Blocks until every dispatched callback has finished.
    fn drain(&self) {
        while !self.idle() {
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for CallbackExecutor {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

pub struct JobQueue {
    core: Arc<QueueCore>,
    executor: CallbackExecutor,
    /// Try-locked by `run_jobs`; enforces a single concurrent manager.
    run_lock: Mutex<()>,
}

impl JobQueue {
    pub fn new(driver: Arc<dyn Driver>, config: QueueConfig) -> Self {
        let core = Arc::new(QueueCore {
            driver,
            list: JobList::new(),
            counters: StatusCounters::new(),
            config,
            open: AtomicBool::new(true),
            user_exit: AtomicBool::new(false),
            running: AtomicBool::new(false),
            pause_on: AtomicBool::new(false),
            submit_complete: AtomicBool::new(false),
            max_duration_secs: AtomicU64::new(0),
            stop_time: Mutex::new(None),
            progress_timestamp: Mutex::new(Instant::now()),
        });
        let executor = CallbackExecutor::new(Arc::clone(&core));
        Self {
            core,
            executor,
            run_lock: Mutex::new(()),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.core.driver
    }

    pub fn is_open(&self) -> bool {
        self.core.open.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.core.pause_on.load(Ordering::SeqCst)
    }

    pub fn pause_on(&self) {
        self.core.pause_on.store(true, Ordering::SeqCst);
    }

    pub fn pause_off(&self) {
        self.core.pause_on.store(false, Ordering::SeqCst);
    }

    pub fn user_exit_requested(&self) -> bool {
        self.core.user_exit.load(Ordering::SeqCst)
    }

    pub fn accepts_jobs(&self) -> bool {
        !self.core.user_exit.load(Ordering::SeqCst) && self.core.open.load(Ordering::SeqCst)
    }

    /// Signals that no further jobs will be registered. Required for
    /// termination when `run_jobs` was started with `num_total_run == 0`.
    /// Idempotent.
    pub fn submit_complete(&self) {
        self.core.submit_complete.store(true, Ordering::SeqCst);
    }

    pub fn set_max_job_duration(&self, duration: Option<Duration>) {
        self.core
            .max_duration_secs
            .store(duration.map_or(0, |d| d.as_secs().max(1)), Ordering::SeqCst);
    }

    pub fn max_job_duration(&self) -> Option<Duration> {
        match self.core.max_duration_secs.load(Ordering::SeqCst) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn set_job_stop_time(&self, stop_time: Option<Instant>) {
        *self.core.stop_time.lock().expect("stop time poisoned") = stop_time;
    }

    pub fn job_stop_time(&self) -> Option<Instant> {
        *self.core.stop_time.lock().expect("stop time poisoned")
    }

    /// Sets the stop time to `now + 0.25 * average wall-time` of the
    /// successful jobs so far; stragglers past that point are killed.
    /// Returns false (and changes nothing) when no job has succeeded yet.
    pub fn set_auto_job_stop_time(&self) -> bool {
        let jobs = self.core.list.read();
        let mut total = Duration::ZERO;
        let mut succeeded = 0u32;
        for node in jobs.iter() {
            if node.status() == JobStatus::Success {
                if let (Some(start), Some(end)) = (node.sim_start(), node.sim_end()) {
                    total += end.duration_since(start);
                    succeeded += 1;
                }
            }
        }
        if succeeded == 0 {
            return false;
        }
        let average = total / succeeded;
        self.set_job_stop_time(Some(Instant::now() + average.mul_f64(0.25)));
        true
    }

    /// Registers a job, transitioning it NOT_ACTIVE -> WAITING. Returns the
    /// queue index, or `None` when the queue no longer accepts jobs.
    pub fn add_job(&self, job: Job) -> Option<usize> {
        if !self.accepts_jobs() {
            return None;
        }
        let config = &self.core.config;
        let node = Arc::new(JobNode::new(
            job,
            config.ok_file.as_deref(),
            config.status_file.as_deref(),
            config.exit_file.as_deref(),
        ));
        self.core.counters.register(JobStatus::NotActive);
        let index = self.core.list.add(Arc::clone(&node));
        self.core
            .counters
            .transition(&node, JobStatus::NotActive, JobStatus::Waiting);
        Some(index)
    }

    pub fn len(&self) -> usize {
        self.core.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.list.is_empty()
    }

    pub fn job_status(&self, index: usize) -> Option<JobStatus> {
        self.core.list.get(index).map(|node| node.status())
    }

    pub fn job_submit_attempt(&self, index: usize) -> Option<usize> {
        self.core.list.get(index).map(|node| node.submit_attempt())
    }

    pub fn status_count(&self, status: JobStatus) -> usize {
        self.core.counters.count(status)
    }

    pub fn status_total(&self) -> usize {
        self.core.counters.total()
    }

    pub fn num_running(&self) -> usize {
        self.status_count(JobStatus::Running)
    }

    pub fn num_pending(&self) -> usize {
        self.status_count(JobStatus::Pending)
    }

    pub fn num_waiting(&self) -> usize {
        self.status_count(JobStatus::Waiting)
    }

    /// Number of jobs in a terminal state.
    pub fn num_complete(&self) -> usize {
        self.core.counters.num_complete()
    }

    /// Instant of the most recent status change across all nodes.
    pub fn progress_timestamp(&self) -> Instant {
        *self
            .core
            .progress_timestamp
            .lock()
            .expect("progress timestamp poisoned")
    }

    /// Best-effort kill of a single job from any thread. Only jobs in a
    /// killable state are affected; returns whether a kill happened.
    pub fn kill_job(&self, index: usize) -> bool {
        let Some(node) = self.core.list.get(index) else {
            return false;
        };
        let _jobs = self.core.list.read();
        let status = node.status();
        if !status.is_killable() {
            return false;
        }
        if self
            .core
            .counters
            .transition(&node, status, JobStatus::DoKill)
        {
            handle_do_kill(&self.core, &node);
            true
        } else {
            false
        }
    }

    /// Reports that the compute node behind a running job is failing; the
    /// job is blacklisted away from that host and retried without consuming
    /// its submit budget.
    pub fn mark_node_failure(&self, index: usize) -> bool {
        let Some(node) = self.core.list.get(index) else {
            return false;
        };
        self.core
            .counters
            .transition(&node, JobStatus::Running, JobStatus::DoKillNodeFailure)
    }

    /// Requests an orderly shutdown from another thread: waits (100 ms
    /// granularity, 10 s timeout) for the manager to be running, then raises
    /// the exit flag. The manager kills every killable job on its next
    /// iteration. Returns whether the flag is set.
    pub fn start_user_exit(&self) -> bool {
        if !self.core.user_exit.load(Ordering::SeqCst) {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                if self.core.running.load(Ordering::SeqCst) {
                    self.core.user_exit.store(true, Ordering::SeqCst);
                    break;
                }
                if Instant::now() >= deadline {
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
        self.core.user_exit.load(Ordering::SeqCst)
    }

    /// Returns the queue to its pristine open state. The previous job list
    /// and tallies are discarded.
    pub fn reset(&self) {
        assert!(
            !self.is_running(),
            "the queue cannot be reset while the manager is running"
        );
        self.executor.drain();
        self.core.list.clear();
        self.core.counters.reset();
        self.core.user_exit.store(false, Ordering::SeqCst);
        self.core.submit_complete.store(false, Ordering::SeqCst);
        self.core.pause_on.store(false, Ordering::SeqCst);
        self.set_job_stop_time(None);
        self.core.open.store(true, Ordering::SeqCst);
    }

    /// Drives all registered jobs to a terminal state. With
    /// `num_total_run == 0` the total is unknown and [`JobQueue::submit_complete`]
    /// must eventually be called. Panics when invoked concurrently or on a
    /// queue that has not been reset since its last run; both are
    /// programming errors.
    pub fn run_jobs(&self, num_total_run: usize, verbose: bool) {
        let guard = self.run_lock.try_lock();
        assert!(
            guard.is_ok(),
            "another thread is already running the queue manager"
        );
        if self.core.user_exit.load(Ordering::SeqCst) {
            log::info!("user exit was requested before the queue started; abandoning the run");
        } else {
            assert!(
                self.core.open.load(Ordering::SeqCst),
                "queue not open and not ready for use; reset() must be called before reuse"
            );
            self.core.running.store(true, Ordering::SeqCst);
            self.main_loop(num_total_run, verbose);
        }
        // Block until the last completion callback has finished.
        self.executor.drain();
        self.core.open.store(false, Ordering::SeqCst);
        self.core.running.store(false, Ordering::SeqCst);
    }

    /// Runs the manager loop on its own thread and returns immediately.
    pub fn run_jobs_threaded(
        self: &Arc<Self>,
        num_total_run: usize,
        verbose: bool,
    ) -> thread::JoinHandle<()> {
        // Raise the running flag here so an immediate start_user_exit() from
        // the caller does not race the thread spawn.
        self.core.running.store(true, Ordering::SeqCst);
        let queue = Arc::clone(self);
        thread::Builder::new()
            .name("job-queue-manager".to_string())
            .spawn(move || queue.run_jobs(num_total_run, verbose))
            .expect("failed to spawn the queue manager thread")
    }

    fn main_loop(&self, num_total_run: usize, verbose: bool) {
        let core = &self.core;
        let base_sleep = core.config.poll_interval;
        let mut sleep_time = base_sleep;
        let mut exit = false;
        let mut complete = false;
        let progress = create_status_spinner(verbose);

        while !complete && !exit {
            {
                let jobs = core.list.read();

                if core.user_exit.load(Ordering::SeqCst) {
                    // One more pass through the body below turns the DO_KILL
                    // marks into IS_KILLED before the loop winds down.
                    log::info!("received user exit in the queue loop; killing active jobs");
                    for node in jobs.iter() {
                        let status = node.status();
                        if status.is_killable() {
                            core.counters.transition(node, status, JobStatus::DoKill);
                        }
                    }
                    exit = true;
                }

                check_expired(core, &jobs);
                let changed = poll_drivers(core, &jobs);

                let num_complete = core.counters.num_complete();
                if num_total_run > 0 && num_complete == num_total_run {
                    complete = true;
                } else if num_total_run == 0
                    && core.submit_complete.load(Ordering::SeqCst)
                    && num_complete == jobs.len()
                {
                    complete = true;
                }

                let mut submitted = 0;
                if !complete {
                    submitted = submit_new_jobs(core, &jobs);
                    dispatch_handlers(core, &self.executor, &jobs);
                }

                progress.set_message(summary_line(&core.counters));
                progress.tick();

                sleep_time = if changed || submitted > 0 {
                    base_sleep
                } else {
                    (sleep_time * 2).min(base_sleep * 8)
                };
            }

            if !exit && !complete {
                thread::yield_now();
                thread::sleep(sleep_time);
            }
        }

        progress.finish_and_clear();
    }
}

fn create_status_spinner(verbose: bool) -> ProgressBar {
    let draw_target = if verbose && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(4)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(None, draw_target);
    pb.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
    pb
}

fn summary_line(counters: &StatusCounters) -> String {
    // EXIT and DONE count as running: their sentinel files have not been
    // checked yet.
    let running = counters.count(JobStatus::Running)
        + counters.count(JobStatus::Done)
        + counters.count(JobStatus::Exit);
    let failed = counters.count(JobStatus::Failed) + counters.count(JobStatus::IsKilled);
    format!(
        "Waiting: {:3}  Pending: {:3}  Running: {:3}  Checking/Loading: {:3}  Failed: {:3}  Complete: {:3}",
        counters.count(JobStatus::Waiting),
        counters.count(JobStatus::Pending),
        running,
        counters.count(JobStatus::RunningDoneCallback),
        failed,
        counters.count(JobStatus::Success),
    )
}

/// Kills RUNNING jobs that have outlived `max_duration` or the queue-wide
/// stop time.
fn check_expired(core: &QueueCore, jobs: &[Arc<JobNode>]) {
    let max_duration_secs = core.max_duration_secs.load(Ordering::SeqCst);
    let stop_time = *core.stop_time.lock().expect("stop time poisoned");
    if max_duration_secs == 0 && stop_time.is_none() {
        return;
    }
    let now = Instant::now();
    for node in jobs {
        if node.status() != JobStatus::Running {
            continue;
        }
        if max_duration_secs > 0 {
            if let Some(start) = node.sim_start() {
                let elapsed = now.duration_since(start);
                if elapsed > Duration::from_secs(max_duration_secs) {
                    log::info!(
                        "job {}: time limit exceeded, {}s > {}s, scheduled for kill",
                        node.name(),
                        elapsed.as_secs(),
                        max_duration_secs
                    );
                    core.counters
                        .transition(node, JobStatus::Running, JobStatus::DoKill);
                }
            }
        }
        if let Some(stop) = stop_time {
            if now >= stop {
                core.counters
                    .transition(node, JobStatus::Running, JobStatus::DoKill);
            }
        }
    }
}

/// Polls the driver for every node it currently owns and records the global
/// progress timestamp. Returns whether any status changed.
fn poll_drivers(core: &QueueCore, jobs: &[Arc<JobNode>]) -> bool {
    let mut changed = false;
    let mut latest = core
        .progress_timestamp
        .lock()
        .expect("progress timestamp poisoned");
    for node in jobs {
        if matches!(
            node.status(),
            JobStatus::Submitted | JobStatus::Pending | JobStatus::Running
        ) {
            changed |= update_from_driver(core, node);
        }
        *latest = (*latest).max(node.timestamp());
    }
    changed
}

/// Walks a node along the transition graph towards the state the driver
/// reports. A fast local job may already be DONE at the first poll, in which
/// case the node passes through RUNNING on the way.
fn update_from_driver(core: &QueueCore, node: &Arc<JobNode>) -> bool {
    let Some(driver_status) = node.with_handle(|handle| handle.status()) else {
        return false;
    };
    let target = match driver_status {
        DriverStatus::Pending => JobStatus::Pending,
        DriverStatus::Running => JobStatus::Running,
        DriverStatus::Done => JobStatus::Done,
        DriverStatus::Exit => JobStatus::Exit,
        DriverStatus::NotActive | DriverStatus::Unknown => return false,
    };
    let mut changed = false;
    while node.status() != target {
        let current = node.status();
        let next = match (current, target) {
            (JobStatus::Submitted, JobStatus::Pending) => JobStatus::Pending,
            (JobStatus::Submitted | JobStatus::Pending, JobStatus::Running | JobStatus::Done) => {
                JobStatus::Running
            }
            (JobStatus::Submitted | JobStatus::Pending, JobStatus::Exit) => JobStatus::Exit,
            (JobStatus::Running, JobStatus::Done) => JobStatus::Done,
            (JobStatus::Running, JobStatus::Exit) => JobStatus::Exit,
            _ => break,
        };
        if !core.counters.transition(node, current, next) {
            break;
        }
        changed = true;
    }
    changed
}

/// Submits WAITING jobs while the running budget and the per-iteration cap
/// allow. `max_running == 0` means unlimited.
fn submit_new_jobs(core: &QueueCore, jobs: &[Arc<JobNode>]) -> usize {
    let waiting = core.counters.count(JobStatus::Waiting);
    if waiting == 0 {
        return 0;
    }
    let max_running = core.driver.max_running();
    let mut budget = if max_running == 0 {
        MAX_SUBMIT_PER_ITERATION.min(waiting)
    } else {
        let active =
            core.counters.count(JobStatus::Pending) + core.counters.count(JobStatus::Running);
        MAX_SUBMIT_PER_ITERATION.min(max_running.saturating_sub(active))
    };

    let mut submitted = 0;
    for node in jobs {
        if budget == 0 {
            break;
        }
        if node.status() != JobStatus::Waiting {
            continue;
        }
        match submit_job(core, node) {
            SubmitOutcome::Submitted => {
                budget -= 1;
                submitted += 1;
            }
            SubmitOutcome::DriverFail | SubmitOutcome::QueueClosed => break,
        }
    }
    submitted
}

fn submit_job(core: &QueueCore, node: &Arc<JobNode>) -> SubmitOutcome {
    if core.user_exit.load(Ordering::SeqCst) || core.pause_on.load(Ordering::SeqCst) {
        return SubmitOutcome::QueueClosed;
    }
    let spec = SubmitSpec {
        job_name: node.name(),
        run_cmd: node.run_cmd(),
        run_path: node.run_path(),
        argv: node.argv(),
        num_cpu: node.num_cpu(),
    };
    match core.driver.submit(&spec) {
        Ok(handle) => {
            node.set_handle(handle);
            node.inc_submit_attempt();
            let moved = core
                .counters
                .transition(node, JobStatus::Waiting, JobStatus::Submitted);
            debug_assert!(moved, "submitted node was not WAITING");
            SubmitOutcome::Submitted
        }
        Err(err) => {
            log::warn!("driver refused {}: {err}", node.name());
            SubmitOutcome::DriverFail
        }
    }
}

/// Hands DONE and EXIT nodes to the callback worker and deals with the kill
/// states inline. Stops as soon as a callback is in flight.
fn dispatch_handlers(core: &QueueCore, executor: &CallbackExecutor, jobs: &[Arc<JobNode>]) {
    for node in jobs {
        if !executor.idle() {
            break;
        }
        match node.status() {
            JobStatus::Done => executor.dispatch(Arc::clone(node), HandlerKind::Done),
            JobStatus::Exit => executor.dispatch(Arc::clone(node), HandlerKind::Exit),
            JobStatus::DoKillNodeFailure => handle_node_failure(core, node),
            JobStatus::DoKill => handle_do_kill(core, node),
            _ => {}
        }
    }
}

fn handle_do_kill(core: &QueueCore, node: &Arc<JobNode>) {
    // WAITING jobs scheduled for kill have no driver handle; for those the
    // kill only forgets the job.
    node.with_handle(|handle| handle.kill());
    node.free_handle();
    core.counters
        .transition(node, JobStatus::DoKill, JobStatus::IsKilled);
}

/// No working contact with the compute node: blacklist it, push the job back
/// through EXIT and give the attempt back so the retry lands elsewhere.
fn handle_node_failure(core: &QueueCore, node: &Arc<JobNode>) {
    node.with_handle(|handle| core.driver.blacklist(handle));
    core.counters
        .transition(node, JobStatus::DoKillNodeFailure, JobStatus::Exit);
    node.dec_submit_attempt();
}

/// Verifies a clean driver exit through the sentinel-file protocol:
/// an exit-file is a definite failure; an ok-file (when configured) must
/// appear within the wait budget; a configured but absent status-file
/// disables the ok-file wait and lets the exit code stand.
fn check_completion_files(core: &QueueCore, node: &JobNode) -> bool {
    if let Some(exit_file) = node.exit_file() {
        if exit_file.exists() {
            return false;
        }
    }
    let Some(ok_file) = node.ok_file() else {
        return true;
    };
    if let Some(status_file) = node.status_file() {
        if !status_file.exists() {
            return true;
        }
    }

    let deadline = Instant::now() + core.config.max_ok_wait;
    loop {
        if ok_file.exists() {
            return true;
        }
        if let Some(exit_file) = node.exit_file() {
            if exit_file.exists() {
                return false;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(OK_POLL_INTERVAL.min(core.config.max_ok_wait));
    }
}

/// DONE handler, run on the callback worker: file protocol, then the user's
/// verification callback, then SUCCESS or EXIT.
fn run_done_handler(core: &QueueCore, node: &Arc<JobNode>) {
    let _jobs = core.list.read();

    // Status may have moved between dispatch and this point.
    if node.status() != JobStatus::Done {
        log::info!(
            "job {}: expected status Done, got {:?}; handler skipped",
            node.name(),
            node.status()
        );
        return;
    }
    if !core
        .counters
        .transition(node, JobStatus::Done, JobStatus::RunningDoneCallback)
    {
        return;
    }

    let mut ok = check_completion_files(core, node);
    if ok {
        ok = node.run_done_callback();
    }
    let target = if ok { JobStatus::Success } else { JobStatus::Exit };
    core.counters
        .transition(node, JobStatus::RunningDoneCallback, target);
    node.free_handle();
}

/// EXIT handler, run on the callback worker: retry within the submit budget,
/// then consult the retry callback, then fail for good.
fn run_exit_handler(core: &QueueCore, node: &Arc<JobNode>) {
    let _jobs = core.list.read();

    if node.status() != JobStatus::Exit {
        log::info!(
            "job {}: expected status Exit, got {:?}; handler skipped",
            node.name(),
            node.status()
        );
        return;
    }

    if node.submit_attempt() < core.config.max_submit {
        // Picked up for another go by the submit loop.
        core.counters
            .transition(node, JobStatus::Exit, JobStatus::Waiting);
    } else if node.run_retry_callback() {
        node.reset_submit_attempt();
        core.counters
            .transition(node, JobStatus::Exit, JobStatus::Waiting);
    } else {
        node.run_exit_callback();
        core.counters
            .transition(node, JobStatus::Exit, JobStatus::Failed);
        log::info!(
            "job {}: failed after {} submit attempts",
            node.name(),
            node.submit_attempt()
        );
    }
    node.free_handle();
}
