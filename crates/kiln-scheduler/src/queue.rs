//! Dispatch order of ready jobs.

use kiln_core::JobId;
use std::collections::{BTreeSet, HashMap};

/// Remembers when each job became ready so that jobs of equal priority are
/// dispatched first-in, first-out.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    entered: HashMap<JobId, u64>,
    next_seq: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `job_id` became ready. Re-entering keeps the original position.
    pub fn enter(&mut self, job_id: &JobId) {
        if !self.entered.contains_key(job_id) {
            self.entered.insert(job_id.clone(), self.next_seq);
            self.next_seq += 1;
        }
    }

    pub fn forget(&mut self, job_id: &JobId) {
        self.entered.remove(job_id);
    }

    /// The job of `ready` to dispatch next: highest priority, then earliest
    /// entry. Jobs without a priority count as zero.
    pub fn pick(&self, ready: &BTreeSet<JobId>, priorities: &HashMap<JobId, f64>) -> Option<JobId> {
        ready
            .iter()
            .map(|job_id| {
                let priority = priorities.get(job_id).copied().unwrap_or(0.0);
                let seq = self.entered.get(job_id).copied().unwrap_or(u64::MAX);
                (job_id, priority, seq)
            })
            .max_by(|(_, pa, sa), (_, pb, sb)| pa.total_cmp(pb).then_with(|| sb.cmp(sa)))
            .map(|(job_id, _, _)| job_id.clone())
    }
}
