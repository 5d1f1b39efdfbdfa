//! Solver work queue
//!
//! The queue keeps attempting workloads as long as the solve is making
//! progress. Every failed workload is pushed to the back; a successful
//! relaxation resets the progress markers so everything is retried against
//! the changed constraints. The queue reports exhaustion when a full cycle
//! completes without any workload scheduling or relaxing, which is what lets
//! workloads with affinity to a batch-mate placed later still succeed.

use std::collections::{HashMap, VecDeque};

use crate::resources::{CPU, MEMORY};
use crate::scheduler::workload::Workload;

/// Work queue feeding the solve loop
#[derive(Debug, Default)]
pub struct WorkQueue {
    pending: VecDeque<Workload>,
    /// Queue length at the time a workload was last re-pushed unrelaxed;
    /// seeing it again at the same length means no progress was made
    last_len: HashMap<String, usize>,
}

impl WorkQueue {
    /// Create a queue over the batch, heaviest requests first
    pub fn new(mut batch: Vec<Workload>) -> Self {
        batch.sort_by(|a, b| {
            b.requests
                .get(CPU)
                .cmp(&a.requests.get(CPU))
                .then(b.requests.get(MEMORY).cmp(&a.requests.get(MEMORY)))
        });
        Self {
            pending: batch.into_iter().collect(),
            last_len: HashMap::new(),
        }
    }

    /// Take the next workload, or `None` once the queue is empty or a full
    /// cycle has made no progress
    pub fn pop(&mut self) -> Option<Workload> {
        let front = self.pending.front()?;
        if self.last_len.get(&front.id) == Some(&self.pending.len()) {
            return None;
        }
        self.pending.pop_front()
    }

    /// Push a failed workload to the back for another pass
    ///
    /// A relaxed workload resets all progress markers since the changed
    /// constraints may unblock any other workload.
    pub fn push(&mut self, workload: Workload, relaxed: bool) {
        self.pending.push_back(workload);
        if relaxed {
            self.last_len.clear();
        } else if let Some(last) = self.pending.back() {
            self.last_len.insert(last.id.clone(), self.pending.len());
        }
    }

    /// Number of workloads still pending
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no workload is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Consume the queue, yielding the workloads that never scheduled
    pub fn into_remaining(self) -> Vec<Workload> {
        self.pending.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Resources;

    #[test]
    fn test_heaviest_first() {
        let small = Workload::new("small").with_requests(Resources::new().cpu(100));
        let large = Workload::new("large").with_requests(Resources::new().cpu(1000));
        let mut queue = WorkQueue::new(vec![small, large]);

        assert_eq!(queue.pop().unwrap().name, "large");
        assert_eq!(queue.pop().unwrap().name, "small");
    }

    #[test]
    fn test_stops_after_unproductive_cycle() {
        let mut queue = WorkQueue::new(vec![Workload::new("a"), Workload::new("b")]);

        let a = queue.pop().unwrap();
        queue.push(a, false);
        let b = queue.pop().unwrap();
        queue.push(b, false);

        // both workloads cycled through without progress
        assert!(queue.pop().is_none());
        assert_eq!(queue.into_remaining().len(), 2);
    }

    #[test]
    fn test_relaxation_resets_progress() {
        let mut queue = WorkQueue::new(vec![Workload::new("a"), Workload::new("b")]);

        let a = queue.pop().unwrap();
        queue.push(a, false);
        let b = queue.pop().unwrap();
        queue.push(b, true);

        // the relaxed push made progress, so both are retried
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_some());
    }

    #[test]
    fn test_progress_by_scheduling_unblocks_retry() {
        let mut queue = WorkQueue::new(vec![Workload::new("a"), Workload::new("b")]);

        let a = queue.pop().unwrap();
        queue.push(a, false);
        // "b" schedules (never pushed back), shrinking the queue
        let _b = queue.pop().unwrap();

        // "a" is retried because the queue length changed
        assert_eq!(queue.pop().unwrap().name, "a");
    }
}
