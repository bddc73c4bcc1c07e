//! Job status values, the legal transition graph and the atomic per-status
//! tally. Every status change in the queue goes through
//! [`StatusCounters::transition`]; direct assignment of a node's status is
//! not possible from outside this module's API.

use std::sync::Mutex;

use crate::queue::node::JobNode;

/// Lifecycle states of one forward-model run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Registered but not yet accepted by the queue loop.
    NotActive,
    /// Ready for submission.
    Waiting,
    /// Handed to the driver, no driver status seen yet.
    Submitted,
    /// Queued inside the compute backend.
    Pending,
    Running,
    /// The driver reported a zero exit; completion files not yet verified.
    Done,
    /// The driver reported failure, or verification failed.
    Exit,
    /// Scheduled for termination by timeout, user exit or an explicit kill.
    DoKill,
    /// The compute node itself is suspect; blacklist and retry elsewhere.
    DoKillNodeFailure,
    /// The completion callback is being evaluated.
    RunningDoneCallback,
    Success,
    Failed,
    IsKilled,
}

pub const STATUS_COUNT: usize = 13;

impl JobStatus {
    pub const ALL: [JobStatus; STATUS_COUNT] = [
        JobStatus::NotActive,
        JobStatus::Waiting,
        JobStatus::Submitted,
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Exit,
        JobStatus::DoKill,
        JobStatus::DoKillNodeFailure,
        JobStatus::RunningDoneCallback,
        JobStatus::Success,
        JobStatus::Failed,
        JobStatus::IsKilled,
    ];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            JobStatus::NotActive => 0,
            JobStatus::Waiting => 1,
            JobStatus::Submitted => 2,
            JobStatus::Pending => 3,
            JobStatus::Running => 4,
            JobStatus::Done => 5,
            JobStatus::Exit => 6,
            JobStatus::DoKill => 7,
            JobStatus::DoKillNodeFailure => 8,
            JobStatus::RunningDoneCallback => 9,
            JobStatus::Success => 10,
            JobStatus::Failed => 11,
            JobStatus::IsKilled => 12,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::IsKilled
        )
    }

    /// States from which a job may be scheduled for termination.
    pub fn is_killable(self) -> bool {
        matches!(
            self,
            JobStatus::Waiting | JobStatus::Pending | JobStatus::Running
        )
    }

    /// The legal transition graph. Anything not listed here is rejected by
    /// [`StatusCounters::transition`].
    pub fn transition_allowed(self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (NotActive, Waiting) => true,
            (Waiting, Pending | Submitted | DoKill) => true,
            (Submitted, Pending | Running | Exit) => true,
            (Pending, Running | Exit | DoKill) => true,
            (Running, Done | Exit | DoKill | DoKillNodeFailure) => true,
            (Done, Success | Exit | RunningDoneCallback) => true,
            (RunningDoneCallback, Success | Exit) => true,
            (Exit, Waiting | Failed) => true,
            (DoKillNodeFailure, Exit) => true,
            (DoKill, IsKilled) => true,
            _ => false,
        }
    }
}

/// Status as reported by a driver backend for one submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    NotActive,
    Pending,
    Running,
    Done,
    Exit,
    Unknown,
}

/// Tally of queue nodes per status value. The invariant
/// `sum(counts) == number of registered nodes` holds whenever no transition
/// is in flight.
#[derive(Default)]
pub struct StatusCounters {
    counts: Mutex<[usize; STATUS_COUNT]>,
}

impl StatusCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts for a freshly created node (status [`JobStatus::NotActive`]).
    pub(crate) fn register(&self, status: JobStatus) {
        let mut counts = self.counts.lock().expect("status counters poisoned");
        counts[status.index()] += 1;
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.counts.lock().expect("status counters poisoned")[status.index()]
    }

    pub fn total(&self) -> usize {
        self.counts
            .lock()
            .expect("status counters poisoned")
            .iter()
            .sum()
    }

    pub fn snapshot(&self) -> [usize; STATUS_COUNT] {
        *self.counts.lock().expect("status counters poisoned")
    }

    /// Number of jobs in a terminal state.
    pub fn num_complete(&self) -> usize {
        let counts = self.counts.lock().expect("status counters poisoned");
        counts[JobStatus::Success.index()]
            + counts[JobStatus::Failed.index()]
            + counts[JobStatus::IsKilled.index()]
    }

    /// Forgets every tally; used when the queue is reset for reuse.
    pub(crate) fn reset(&self) {
        *self.counts.lock().expect("status counters poisoned") = [0; STATUS_COUNT];
    }

    /// The single status mutation primitive: verifies the node currently has
    /// status `from`, that the edge `from -> to` is legal, and then swaps the
    /// status and adjusts both tallies under the counter lock. Returns false
    /// without side effects on any mismatch.
    pub fn transition(&self, node: &JobNode, from: JobStatus, to: JobStatus) -> bool {
        if !from.transition_allowed(to) {
            return false;
        }
        let mut counts = self.counts.lock().expect("status counters poisoned");
        let mut status = node.status_slot().lock().expect("job status poisoned");
        if *status != from {
            return false;
        }
        *status = to;
        counts[from.index()] -= 1;
        counts[to.index()] += 1;
        drop(status);
        node.note_status_change(to);
        true
    }
}
