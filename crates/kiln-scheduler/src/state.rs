//! The manager's partition of its jobs.

use kiln_core::{Error, JobId, JobSetsSnapshot, Result};
use std::collections::BTreeSet;

/// Sets tracked by the manager.
///
/// Every job in `all_targets` is in exactly one of `done`, `failed`,
/// `blocked`, `todo`, `ready_todo`, `processing` and `deleted`.
#[derive(Debug, Clone, Default)]
pub struct JobSets {
    /// Jobs the caller asked for.
    pub targets: BTreeSet<JobId>,
    /// Targets plus every job they (transitively) need.
    pub all_targets: BTreeSet<JobId>,
    pub done: BTreeSet<JobId>,
    pub failed: BTreeSet<JobId>,
    pub blocked: BTreeSet<JobId>,
    pub todo: BTreeSet<JobId>,
    pub ready_todo: BTreeSet<JobId>,
    pub processing: BTreeSet<JobId>,
    pub deleted: BTreeSet<JobId>,
}

impl JobSets {
    fn partition(&self) -> [(&'static str, &BTreeSet<JobId>); 7] {
        [
            ("done", &self.done),
            ("failed", &self.failed),
            ("blocked", &self.blocked),
            ("todo", &self.todo),
            ("ready_todo", &self.ready_todo),
            ("processing", &self.processing),
            ("deleted", &self.deleted),
        ]
    }

    /// Remove `job_id` from every partition set (not from the targets).
    pub fn remove_everywhere(&mut self, job_id: &JobId) {
        self.done.remove(job_id);
        self.failed.remove(job_id);
        self.blocked.remove(job_id);
        self.todo.remove(job_id);
        self.ready_todo.remove(job_id);
        self.processing.remove(job_id);
        self.deleted.remove(job_id);
    }

    /// Whether a job is done, failed or blocked.
    pub fn is_terminal(&self, job_id: &JobId) -> bool {
        self.done.contains(job_id) || self.failed.contains(job_id) || self.blocked.contains(job_id)
    }

    /// Whether anything is left to run or collect.
    pub fn has_work(&self) -> bool {
        !(self.todo.is_empty() && self.ready_todo.is_empty() && self.processing.is_empty())
    }

    pub fn check_invariants(&self) -> Result<()> {
        let sets = self.partition();
        let mut union = BTreeSet::new();
        for (i, (name, set)) in sets.iter().enumerate() {
            for (other_name, other) in &sets[i + 1..] {
                if let Some(job_id) = set.intersection(other).next() {
                    return Err(Error::bug(format!(
                        "job {} is both {} and {}",
                        job_id, name, other_name
                    )));
                }
            }
            union.extend(set.iter().cloned());
        }
        if union != self.all_targets {
            let stray: Vec<String> = union
                .symmetric_difference(&self.all_targets)
                .map(JobId::to_string)
                .collect();
            return Err(Error::bug(format!(
                "job sets do not partition all_targets: {}",
                stray.join(", ")
            )));
        }
        if let Some(job_id) = self.targets.difference(&self.all_targets).next() {
            return Err(Error::bug(format!("target {} is not tracked", job_id)));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> JobSetsSnapshot {
        JobSetsSnapshot {
            targets: self.targets.clone(),
            all_targets: self.all_targets.clone(),
            done: self.done.clone(),
            failed: self.failed.clone(),
            blocked: self.blocked.clone(),
            todo: self.todo.clone(),
            ready_todo: self.ready_todo.clone(),
            processing: self.processing.clone(),
            deleted: self.deleted.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> JobId {
        JobId::from(s)
    }

    #[test]
    fn test_partition_ok() {
        let mut sets = JobSets::default();
        sets.all_targets.extend([id("a"), id("b")]);
        sets.targets.insert(id("b"));
        sets.done.insert(id("a"));
        sets.todo.insert(id("b"));
        assert!(sets.check_invariants().is_ok());
        assert!(sets.has_work());
    }

    #[test]
    fn test_overlap_detected() {
        let mut sets = JobSets::default();
        sets.all_targets.insert(id("a"));
        sets.done.insert(id("a"));
        sets.failed.insert(id("a"));
        let err = sets.check_invariants().unwrap_err();
        assert!(err.to_string().contains("both done and failed"));
    }

    #[test]
    fn test_untracked_job_detected() {
        let mut sets = JobSets::default();
        sets.all_targets.insert(id("a"));
        assert!(sets.check_invariants().is_err());

        sets.remove_everywhere(&id("a"));
        sets.todo.insert(id("a"));
        assert!(sets.check_invariants().is_ok());
        sets.remove_everywhere(&id("a"));
        assert!(!sets.has_work());
    }
}
