//! End-to-end queue scenarios against the local driver: the happy path,
//! retries, timeouts, user exit and the completion-signalling boundaries.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use osmos::queue::{
    Driver, Job, JobQueue, JobStatus, LocalDriver, MAX_RUNNING, QueueConfig, set_data_root,
};

fn fast_config() -> QueueConfig {
    QueueConfig {
        max_submit: 1,
        max_ok_wait: Duration::from_secs(2),
        poll_interval: Duration::from_millis(25),
        ok_file: Some("OK".to_string()),
        status_file: None,
        exit_file: Some("ERROR".to_string()),
    }
}

fn local_queue(config: QueueConfig, max_running: usize) -> Arc<JobQueue> {
    let driver = Arc::new(LocalDriver::new());
    if max_running > 0 {
        assert!(driver.set_option(MAX_RUNNING, &max_running.to_string()));
    }
    Arc::new(JobQueue::new(driver, config))
}

fn shell_job(name: &str, dir: &Path, script: &str) -> Job {
    Job::new(name, "sh", dir).arg("-c").arg(script)
}

fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, predicate: F) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn happy_path_respects_the_running_cap() {
    let dirs: Vec<TempDir> = (0..4).map(|_| TempDir::new().unwrap()).collect();
    let queue = local_queue(fast_config(), 2);
    for (i, dir) in dirs.iter().enumerate() {
        queue
            .add_job(shell_job(
                &format!("sim-{i}"),
                dir.path(),
                "sleep 0.2 && touch OK",
            ))
            .unwrap();
    }

    let handle = queue.run_jobs_threaded(4, false);
    let mut peak_running = 0;
    while queue.is_running() {
        peak_running = peak_running.max(queue.num_running());
        std::thread::sleep(Duration::from_millis(5));
    }
    handle.join().unwrap();

    for i in 0..4 {
        assert_eq!(queue.job_status(i), Some(JobStatus::Success), "job {i}");
        assert_eq!(queue.job_submit_attempt(i), Some(1));
    }
    assert!(peak_running <= 2, "saw {peak_running} concurrent jobs");
    assert_eq!(queue.status_total(), 4);
    assert_eq!(queue.num_complete(), 4);
    assert!(!queue.is_open(), "a finished queue needs a reset before reuse");
}

#[test]
fn failed_first_attempt_is_retried_to_success() {
    let dir = TempDir::new().unwrap();
    let config = QueueConfig {
        max_submit: 2,
        ..fast_config()
    };
    let queue = local_queue(config, 0);
    queue
        .add_job(shell_job(
            "flaky",
            dir.path(),
            "if [ -f marker ]; then rm -f ERROR && touch OK; \
             else touch marker ERROR && exit 1; fi",
        ))
        .unwrap();

    queue.run_jobs(1, false);

    assert_eq!(queue.job_status(0), Some(JobStatus::Success));
    assert_eq!(queue.job_submit_attempt(0), Some(2));
}

#[test]
fn exhausted_attempts_consult_retry_then_fail() {
    let dir = TempDir::new().unwrap();
    let retry_consulted = Arc::new(AtomicUsize::new(0));
    let exited = Arc::new(AtomicBool::new(false));

    let retry_counter = Arc::clone(&retry_consulted);
    let exit_flag = Arc::clone(&exited);
    let queue = local_queue(fast_config(), 0);
    queue
        .add_job(
            shell_job("doomed", dir.path(), "exit 1")
                .on_retry(move || retry_counter.fetch_add(1, Ordering::SeqCst) == 0)
                .on_exit(move || exit_flag.store(true, Ordering::SeqCst)),
        )
        .unwrap();

    queue.run_jobs(1, false);

    assert_eq!(queue.job_status(0), Some(JobStatus::Failed));
    // First consultation granted one fresh round, the second gave up.
    assert_eq!(retry_consulted.load(Ordering::SeqCst), 2);
    assert!(exited.load(Ordering::SeqCst));
    assert!(queue.job_submit_attempt(0).unwrap() <= 1);
}

#[test]
fn rejected_outputs_turn_success_into_failure() {
    let dir = TempDir::new().unwrap();
    let queue = local_queue(fast_config(), 0);
    queue
        .add_job(shell_job("bad-output", dir.path(), "touch OK").on_done(|| false))
        .unwrap();

    queue.run_jobs(1, false);
    assert_eq!(queue.job_status(0), Some(JobStatus::Failed));
}

#[test]
fn overlong_job_is_killed_within_budget() {
    let dir = TempDir::new().unwrap();
    let queue = local_queue(fast_config(), 0);
    queue
        .add_job(shell_job("sleeper", dir.path(), "sleep 10"))
        .unwrap();
    queue.set_max_job_duration(Some(Duration::from_secs(1)));

    let started = Instant::now();
    queue.run_jobs(1, false);
    let elapsed = started.elapsed();

    assert_eq!(queue.job_status(0), Some(JobStatus::IsKilled));
    assert!(
        elapsed < Duration::from_secs(3),
        "kill took {elapsed:?}, expected under 3s"
    );
}

#[test]
fn user_exit_kills_every_running_job() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let queue = local_queue(fast_config(), 0);
    for (i, dir) in dirs.iter().enumerate() {
        queue
            .add_job(shell_job(&format!("held-{i}"), dir.path(), "sleep 30"))
            .unwrap();
    }

    let started = Instant::now();
    let handle = queue.run_jobs_threaded(3, false);
    wait_for("all three jobs running", Duration::from_secs(5), || {
        queue.num_running() == 3
    });

    assert!(queue.start_user_exit());
    handle.join().unwrap();

    for i in 0..3 {
        assert_eq!(queue.job_status(i), Some(JobStatus::IsKilled), "job {i}");
        assert_eq!(queue.job_submit_attempt(i), Some(1), "no resubmission");
    }
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!queue.accepts_jobs());
}

#[test]
fn zero_max_running_means_unlimited() {
    let dirs: Vec<TempDir> = (0..8).map(|_| TempDir::new().unwrap()).collect();
    // MAX_RUNNING left unset: the per-iteration budget of five is the only
    // submission bound, so all eight jobs end up running at once.
    let queue = local_queue(fast_config(), 0);
    for (i, dir) in dirs.iter().enumerate() {
        queue
            .add_job(shell_job(&format!("wide-{i}"), dir.path(), "sleep 30"))
            .unwrap();
    }

    let handle = queue.run_jobs_threaded(8, false);
    wait_for("all eight jobs running", Duration::from_secs(5), || {
        queue.num_running() == 8
    });
    queue.start_user_exit();
    handle.join().unwrap();
}

#[test]
fn unknown_total_waits_for_submit_complete() {
    let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
    let queue = local_queue(fast_config(), 0);
    for (i, dir) in dirs.iter().enumerate() {
        queue
            .add_job(shell_job(&format!("open-{i}"), dir.path(), "touch OK"))
            .unwrap();
    }

    let handle = queue.run_jobs_threaded(0, false);
    wait_for("both jobs terminal", Duration::from_secs(10), || {
        queue.num_complete() == 2
    });

    // Everything registered is done, but the queue cannot know whether more
    // work is coming until told so.
    std::thread::sleep(Duration::from_millis(200));
    assert!(queue.is_running());

    queue.submit_complete();
    handle.join().unwrap();
    assert_eq!(queue.num_complete(), 2);
}

#[test]
fn waiting_job_can_be_killed_externally() {
    let dir = TempDir::new().unwrap();
    let queue = local_queue(fast_config(), 0);
    queue
        .add_job(shell_job("parked", dir.path(), "true"))
        .unwrap();

    assert_eq!(queue.job_status(0), Some(JobStatus::Waiting));
    assert!(queue.kill_job(0));
    assert_eq!(queue.job_status(0), Some(JobStatus::IsKilled));
    // Repeated kills are refused once the job is terminal.
    assert!(!queue.kill_job(0));
    assert_eq!(queue.status_total(), 1);
}

#[test]
fn node_failure_retries_without_spending_the_budget() {
    let dir = TempDir::new().unwrap();
    let queue = local_queue(fast_config(), 0);
    queue
        .add_job(shell_job("shaky-host", dir.path(), "sleep 3"))
        .unwrap();

    let handle = queue.run_jobs_threaded(1, false);
    wait_for("job running", Duration::from_secs(5), || {
        queue.num_running() == 1
    });
    assert_eq!(queue.job_submit_attempt(0), Some(1));

    assert!(queue.mark_node_failure(0));
    wait_for("job resubmitted elsewhere", Duration::from_secs(5), || {
        queue.num_running() == 1 && queue.job_submit_attempt(0) == Some(1)
    });

    queue.start_user_exit();
    handle.join().unwrap();
    // The attempt returned by the blacklist path was spent again on the
    // retry, leaving the budget where it started.
    assert_eq!(queue.job_submit_attempt(0), Some(1));
    assert_eq!(queue.job_status(0), Some(JobStatus::IsKilled));
}

#[test]
fn paused_queue_submits_nothing() {
    let dir = TempDir::new().unwrap();
    let queue = local_queue(fast_config(), 0);
    queue
        .add_job(shell_job("held", dir.path(), "touch OK"))
        .unwrap();
    queue.pause_on();

    let handle = queue.run_jobs_threaded(1, false);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(queue.job_status(0), Some(JobStatus::Waiting));

    queue.pause_off();
    handle.join().unwrap();
    assert_eq!(queue.job_status(0), Some(JobStatus::Success));
}

#[test]
fn forward_models_inherit_data_root() {
    let data_dir = TempDir::new().unwrap();
    let run_dir = TempDir::new().unwrap();
    set_data_root(data_dir.path());

    let queue = local_queue(fast_config(), 0);
    queue
        .add_job(shell_job(
            "env-check",
            run_dir.path(),
            "printf %s \"$DATA_ROOT\" > data_root.txt && touch OK",
        ))
        .unwrap();
    queue.run_jobs(1, false);

    assert_eq!(queue.job_status(0), Some(JobStatus::Success));
    let recorded = std::fs::read_to_string(run_dir.path().join("data_root.txt")).unwrap();
    assert_eq!(recorded, data_dir.path().to_string_lossy());
}
