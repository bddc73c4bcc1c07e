//! Slurm driver. The cluster side is modeled through the external command
//! names (`sbatch`, `scancel`, `squeue`, `scontrol`), all configurable
//! through string options so tests and site installations can interpose
//! their own binaries. Job status is answered from a cache refreshed at most
//! once per poll-timeout interval.

use std::collections::BTreeSet;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::queue::driver::{Driver, DriverError, JobHandle, MAX_RUNNING, SubmitSpec};
use crate::queue::status::DriverStatus;

pub const PARTITION: &str = "PARTITION";
pub const SBATCH: &str = "SBATCH";
pub const SCANCEL: &str = "SCANCEL";
pub const SQUEUE: &str = "SQUEUE";
pub const SCONTROL: &str = "SCONTROL";
pub const SQUEUE_TIMEOUT: &str = "SQUEUE_TIMEOUT";
pub const MAX_RUNTIME: &str = "MAX_RUNTIME";
pub const MEMORY: &str = "MEMORY";
pub const MEMORY_PER_CPU: &str = "MEMORY_PER_CPU";
pub const INCLUDE_HOST: &str = "INCLUDE_HOST";
pub const EXCLUDE_HOST: &str = "EXCLUDE_HOST";

struct SlurmOptions {
    sbatch: String,
    scancel: String,
    squeue: String,
    scontrol: String,
    partition: Option<String>,
    memory: Option<String>,
    memory_per_cpu: Option<String>,
    max_runtime_secs: Option<u64>,
    squeue_timeout_secs: u64,
    include_hosts: BTreeSet<String>,
    exclude_hosts: BTreeSet<String>,
    max_running: usize,
}

impl Default for SlurmOptions {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            scancel: "scancel".to_string(),
            squeue: "squeue".to_string(),
            scontrol: "scontrol".to_string(),
            partition: None,
            memory: None,
            memory_per_cpu: None,
            max_runtime_secs: None,
            squeue_timeout_secs: 2,
            include_hosts: BTreeSet::new(),
            exclude_hosts: BTreeSet::new(),
            max_running: 0,
        }
    }
}

fn join_hosts(hosts: &BTreeSet<String>) -> String {
    hosts.iter().cloned().collect::<Vec<_>>().join(",")
}

/// Maps a slurm job state label to the driver status vocabulary.
fn parse_state(state: &str) -> DriverStatus {
    match state.trim() {
        "PENDING" | "CONFIGURING" => DriverStatus::Pending,
        "RUNNING" | "COMPLETING" => DriverStatus::Running,
        "COMPLETED" => DriverStatus::Done,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "BOOT_FAIL" | "DEADLINE" => DriverStatus::Exit,
        _ => DriverStatus::Unknown,
    }
}

struct StatusCache {
    status: DriverStatus,
    fetched_at: Option<Instant>,
    node_list: Option<String>,
}

pub struct SlurmHandle {
    job_id: u64,
    options: Arc<Mutex<SlurmOptions>>,
    cache: Mutex<StatusCache>,
}

impl SlurmHandle {
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    fn query(&self, squeue: &str, scontrol: &str) -> (DriverStatus, Option<String>) {
        let output = Command::new(squeue)
            .args(["-h", "-o", "%T", "-j", &self.job_id.to_string()])
            .output();
        if let Ok(out) = &output {
            let text = String::from_utf8_lossy(&out.stdout);
            let state = text.trim();
            if out.status.success() && !state.is_empty() {
                return (parse_state(state), None);
            }
        }

        // Finished jobs drop out of the squeue listing; ask scontrol for the
        // final state and the node the job ran on.
        let output = Command::new(scontrol)
            .args(["show", "job", &self.job_id.to_string()])
            .output();
        if let Ok(out) = output {
            let text = String::from_utf8_lossy(&out.stdout);
            let mut status = DriverStatus::Unknown;
            let mut node_list = None;
            for token in text.split_whitespace() {
                if let Some(state) = token.strip_prefix("JobState=") {
                    status = parse_state(state);
                } else if let Some(nodes) = token.strip_prefix("NodeList=") {
                    if nodes != "(null)" {
                        node_list = Some(nodes.to_string());
                    }
                }
            }
            return (status, node_list);
        }
        (DriverStatus::Unknown, None)
    }
}

impl JobHandle for SlurmHandle {
    fn status(&self) -> DriverStatus {
        let (squeue, scontrol, timeout) = {
            let options = self.options.lock().expect("slurm options poisoned");
            (
                options.squeue.clone(),
                options.scontrol.clone(),
                Duration::from_secs(options.squeue_timeout_secs),
            )
        };
        let mut cache = self.cache.lock().expect("slurm status cache poisoned");
        if matches!(cache.status, DriverStatus::Done | DriverStatus::Exit) {
            return cache.status;
        }
        if let Some(at) = cache.fetched_at {
            if at.elapsed() < timeout {
                return cache.status;
            }
        }
        let (status, node_list) = self.query(&squeue, &scontrol);
        cache.fetched_at = Some(Instant::now());
        if status != DriverStatus::Unknown {
            cache.status = status;
        }
        if node_list.is_some() {
            cache.node_list = node_list;
        }
        cache.status
    }

    fn kill(&self) {
        let scancel = self
            .options
            .lock()
            .expect("slurm options poisoned")
            .scancel
            .clone();
        let _ = Command::new(scancel)
            .arg(self.job_id.to_string())
            .output();
    }

    fn hostname(&self) -> Option<String> {
        self.cache
            .lock()
            .expect("slurm status cache poisoned")
            .node_list
            .clone()
    }
}

#[derive(Default)]
pub struct SlurmDriver {
    options: Arc<Mutex<SlurmOptions>>,
}

impl SlurmDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sbatch argument vector for one job, derived from the current
    /// option table.
    pub fn render_submit_argv(&self, spec: &SubmitSpec<'_>) -> Vec<String> {
        let options = self.options.lock().expect("slurm options poisoned");
        let mut argv = vec![
            format!("--job-name={}", spec.job_name),
            format!("--chdir={}", spec.run_path.display()),
            format!("--ntasks={}", spec.num_cpu),
        ];
        if let Some(partition) = &options.partition {
            argv.push(format!("--partition={partition}"));
        }
        if let Some(memory) = &options.memory {
            argv.push(format!("--mem={memory}"));
        }
        if let Some(memory) = &options.memory_per_cpu {
            argv.push(format!("--mem-per-cpu={memory}"));
        }
        if let Some(runtime) = options.max_runtime_secs {
            argv.push(format!("--time={}", runtime.div_ceil(60).max(1)));
        }
        if !options.include_hosts.is_empty() {
            argv.push(format!("--nodelist={}", join_hosts(&options.include_hosts)));
        }
        if !options.exclude_hosts.is_empty() {
            argv.push(format!("--exclude={}", join_hosts(&options.exclude_hosts)));
        }
        argv.push(spec.run_cmd.to_string());
        argv.extend(spec.argv.iter().cloned());
        argv
    }
}

impl Driver for SlurmDriver {
    fn submit(&self, spec: &SubmitSpec<'_>) -> Result<Box<dyn JobHandle>, DriverError> {
        let argv = self.render_submit_argv(spec);
        let sbatch = self
            .options
            .lock()
            .expect("slurm options poisoned")
            .sbatch
            .clone();
        let output = Command::new(&sbatch)
            .arg("--parsable")
            .args(&argv)
            .output()
            .map_err(|source| DriverError::Spawn {
                cmd: sbatch.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(DriverError::SubmitFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = stdout
            .trim()
            .split(|c: char| !c.is_ascii_digit())
            .find(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                DriverError::SubmitFailed(format!("no job id in sbatch output {stdout:?}"))
            })?;
        log::debug!("slurm job {job_id} submitted for {}", spec.job_name);
        Ok(Box::new(SlurmHandle {
            job_id,
            options: Arc::clone(&self.options),
            cache: Mutex::new(StatusCache {
                status: DriverStatus::Pending,
                fetched_at: None,
                node_list: None,
            }),
        }))
    }

    fn blacklist(&self, handle: &dyn JobHandle) {
        if let Some(host) = handle.hostname() {
            let mut options = self.options.lock().expect("slurm options poisoned");
            log::info!("excluding compute host {host} from future submissions");
            options.exclude_hosts.insert(host);
        }
    }

    fn set_option(&self, key: &str, value: &str) -> bool {
        let mut options = self.options.lock().expect("slurm options poisoned");
        match key {
            SBATCH => options.sbatch = value.to_string(),
            SCANCEL => options.scancel = value.to_string(),
            SQUEUE => options.squeue = value.to_string(),
            SCONTROL => options.scontrol = value.to_string(),
            PARTITION => options.partition = Some(value.to_string()),
            MEMORY => options.memory = Some(value.to_string()),
            MEMORY_PER_CPU => options.memory_per_cpu = Some(value.to_string()),
            MAX_RUNTIME => match value.parse() {
                Ok(secs) => options.max_runtime_secs = Some(secs),
                Err(_) => return false,
            },
            SQUEUE_TIMEOUT => match value.parse() {
                Ok(secs) => options.squeue_timeout_secs = secs,
                Err(_) => return false,
            },
            MAX_RUNNING => match value.parse() {
                Ok(count) => options.max_running = count,
                Err(_) => return false,
            },
            // Host lists accumulate: the union of every set call.
            INCLUDE_HOST => {
                options
                    .include_hosts
                    .extend(value.split(',').filter(|s| !s.is_empty()).map(str::to_string));
            }
            EXCLUDE_HOST => {
                options
                    .exclude_hosts
                    .extend(value.split(',').filter(|s| !s.is_empty()).map(str::to_string));
            }
            _ => return false,
        }
        true
    }

    fn option(&self, key: &str) -> Option<String> {
        let options = self.options.lock().expect("slurm options poisoned");
        match key {
            SBATCH => Some(options.sbatch.clone()),
            SCANCEL => Some(options.scancel.clone()),
            SQUEUE => Some(options.squeue.clone()),
            SCONTROL => Some(options.scontrol.clone()),
            PARTITION => options.partition.clone(),
            MEMORY => options.memory.clone(),
            MEMORY_PER_CPU => options.memory_per_cpu.clone(),
            MAX_RUNTIME => options.max_runtime_secs.map(|v| v.to_string()),
            SQUEUE_TIMEOUT => Some(options.squeue_timeout_secs.to_string()),
            MAX_RUNNING => Some(options.max_running.to_string()),
            INCLUDE_HOST => Some(join_hosts(&options.include_hosts)),
            EXCLUDE_HOST => Some(join_hosts(&options.exclude_hosts)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn host_lists_accumulate_as_a_union() {
        let driver = SlurmDriver::new();
        assert!(driver.set_option(EXCLUDE_HOST, "node1,node2"));
        assert!(driver.set_option(EXCLUDE_HOST, "node2,node3"));
        assert_eq!(
            driver.option(EXCLUDE_HOST).as_deref(),
            Some("node1,node2,node3")
        );

        assert!(driver.set_option(INCLUDE_HOST, "fast1"));
        assert!(driver.set_option(INCLUDE_HOST, "fast0"));
        assert_eq!(driver.option(INCLUDE_HOST).as_deref(), Some("fast0,fast1"));
    }

    #[test]
    fn numeric_options_reject_garbage() {
        let driver = SlurmDriver::new();
        assert!(!driver.set_option(MAX_RUNTIME, "an hour"));
        assert!(!driver.set_option(SQUEUE_TIMEOUT, "-3"));
        assert!(!driver.set_option(MAX_RUNNING, "lots"));
        assert!(driver.set_option(MAX_RUNNING, "16"));
        assert_eq!(driver.max_running(), 16);
        assert!(!driver.set_option("NO_SUCH_KEY", "value"));
        assert!(driver.option("NO_SUCH_KEY").is_none());
    }

    #[test]
    fn submit_argv_reflects_the_option_table() {
        let driver = SlurmDriver::new();
        driver.set_option(PARTITION, "reservoir");
        driver.set_option(MEMORY, "4G");
        driver.set_option(MAX_RUNTIME, "3600");
        driver.set_option(EXCLUDE_HOST, "badnode");

        let argv_strings = ["--input".to_string(), "case.data".to_string()];
        let spec = SubmitSpec {
            job_name: "sim-007",
            run_cmd: "/opt/forward_model.sh",
            run_path: Path::new("/scratch/run-007"),
            argv: &argv_strings,
            num_cpu: 8,
        };
        let argv = driver.render_submit_argv(&spec);
        assert!(argv.contains(&"--job-name=sim-007".to_string()));
        assert!(argv.contains(&"--chdir=/scratch/run-007".to_string()));
        assert!(argv.contains(&"--ntasks=8".to_string()));
        assert!(argv.contains(&"--partition=reservoir".to_string()));
        assert!(argv.contains(&"--mem=4G".to_string()));
        assert!(argv.contains(&"--time=60".to_string()));
        assert!(argv.contains(&"--exclude=badnode".to_string()));
        // Command and its arguments come last, in order.
        let tail: Vec<_> = argv.iter().rev().take(3).rev().cloned().collect();
        assert_eq!(tail, ["/opt/forward_model.sh", "--input", "case.data"]);
    }

    #[test]
    fn state_labels_map_to_driver_statuses() {
        assert_eq!(parse_state("PENDING"), DriverStatus::Pending);
        assert_eq!(parse_state("RUNNING"), DriverStatus::Running);
        assert_eq!(parse_state("COMPLETING"), DriverStatus::Running);
        assert_eq!(parse_state("COMPLETED"), DriverStatus::Done);
        assert_eq!(parse_state("FAILED"), DriverStatus::Exit);
        assert_eq!(parse_state("NODE_FAIL"), DriverStatus::Exit);
        assert_eq!(parse_state("WEIRD"), DriverStatus::Unknown);
    }
}
