//! Ordered collection of job nodes behind a readers-writer lock. The manager
//! loop and status queries take the read side; registration takes the write
//! side.

use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::queue::node::JobNode;

#[derive(Default)]
pub struct JobList {
    jobs: RwLock<Vec<Arc<JobNode>>>,
}

impl JobList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node and stamps its queue index. Write-locks the list.
    pub fn add(&self, node: Arc<JobNode>) -> usize {
        let mut jobs = self.jobs.write().expect("job list poisoned");
        let index = jobs.len();
        node.set_queue_index(index);
        jobs.push(node);
        index
    }

    /// Read guard over the nodes; held by the manager for a whole loop
    /// iteration.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<JobNode>>> {
        self.jobs.read().expect("job list poisoned")
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Arc<JobNode>> {
        self.read().get(index).cloned()
    }

    pub(crate) fn clear(&self) {
        self.jobs.write().expect("job list poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::node::Job;
    use std::path::Path;

    #[test]
    fn add_assigns_consecutive_indices() {
        let list = JobList::new();
        for i in 0..3 {
            let node = Arc::new(JobNode::new(
                Job::new(format!("job-{i}"), "true", Path::new(".")),
                None,
                None,
                None,
            ));
            let index = list.add(Arc::clone(&node));
            assert_eq!(index, i);
            assert_eq!(node.queue_index(), Some(i));
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.get(1).unwrap().name(), "job-1");
        assert!(list.get(7).is_none());
    }
}
