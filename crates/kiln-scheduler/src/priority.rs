//! Dispatch priorities.
//!
//! Dynamic jobs go first since they reveal more of the graph. Other jobs are
//! ranked by how likely they are to succeed and how long they usually take,
//! plus the priority of the most urgent job waiting on them.

use kiln_core::{CacheState, JobId, Result, Store};
use kiln_db as db;
use kiln_db_queries::CacheQueryDB;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

pub const DYNAMIC_BASE_PRIORITY: f64 = 100.0;

const PRIORITY_FAILED_RESOURCES: f64 = 0.001;
const PRIORITY_FAILED: f64 = 0.1;
const PRIORITY_PROCESSING: f64 = 0.01;
const PRIORITY_DEFAULT: f64 = 1.0;

/// Historical behavior of a job or command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobStats {
    /// Probability that a run succeeds.
    pub prob_success: f64,
    /// Where the job's run time falls among all recorded run times, in `[0, 1]`.
    pub time_percentile: f64,
}

impl Default for JobStats {
    fn default() -> Self {
        Self {
            prob_success: 0.95,
            time_percentile: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryStats {
    pub by_job: HashMap<JobId, JobStats>,
    pub by_command: HashMap<String, JobStats>,
}

impl HistoryStats {
    /// Derive statistics from the caches of finished jobs.
    ///
    /// Commands are keyed by the job's `command_desc`.
    pub fn from_store(store: &dyn Store) -> Result<Self> {
        let mut outcomes: HashMap<String, (u32, u32)> = HashMap::new();
        let mut walltimes: Vec<(JobId, String, f64)> = Vec::new();

        for job_id in db::all_jobs(store)? {
            let cache = db::get_job_cache(store, &job_id)?;
            let succeeded = match cache.state {
                CacheState::Done => true,
                CacheState::Failed => false,
                _ => continue,
            };
            let job = db::get_job(store, &job_id)?;
            let entry = outcomes.entry(job.command_desc.clone()).or_default();
            entry.1 += 1;
            if succeeded {
                entry.0 += 1;
                if let Some(walltime) = cache.walltime_used {
                    walltimes.push((job_id, job.command_desc, walltime));
                }
            }
        }

        let mut stats = HistoryStats::default();
        for (command, (successes, runs)) in &outcomes {
            stats.by_command.insert(
                command.clone(),
                JobStats {
                    prob_success: f64::from(*successes) / f64::from(*runs),
                    ..JobStats::default()
                },
            );
        }

        walltimes.sort_by(|a, b| a.2.total_cmp(&b.2));
        let n = walltimes.len();
        for (rank, (job_id, command, _)) in walltimes.into_iter().enumerate() {
            let time_percentile = if n > 1 {
                rank as f64 / (n - 1) as f64
            } else {
                0.5
            };
            let prob_success = stats
                .by_command
                .get(&command)
                .map(|s| s.prob_success)
                .unwrap_or(JobStats::default().prob_success);
            stats.by_job.insert(
                job_id,
                JobStats {
                    prob_success,
                    time_percentile,
                },
            );
        }
        Ok(stats)
    }

    pub fn lookup(&self, job_id: &JobId, command: &str) -> JobStats {
        self.by_job
            .get(job_id)
            .or_else(|| self.by_command.get(command))
            .copied()
            .unwrap_or_default()
    }
}

/// Priority of `job_id` among the jobs in `targets`. Higher runs first.
pub fn compute_priority(
    job_id: &JobId,
    cq: &mut CacheQueryDB,
    targets: &BTreeSet<JobId>,
    stats: &HistoryStats,
    memo: &mut HashMap<JobId, f64>,
) -> Result<f64> {
    if let Some(priority) = memo.get(job_id) {
        return Ok(*priority);
    }

    let job = cq.get_job(job_id)?;
    if job.needs_context {
        let priority = DYNAMIC_BASE_PRIORITY - job.definition_depth() as f64;
        memo.insert(job_id.clone(), priority);
        return Ok(priority);
    }

    // Placeholder so a cycle through the parents terminates.
    memo.insert(job_id.clone(), 0.0);

    let cache = cq.get_job_cache(job_id)?;
    let base = match cache.state {
        CacheState::Failed if cache.failed_for_resources() => PRIORITY_FAILED_RESOURCES,
        CacheState::Failed => PRIORITY_FAILED,
        CacheState::Processing => PRIORITY_PROCESSING,
        _ => PRIORITY_DEFAULT,
    };
    let job_stats = stats.lookup(job_id, &job.command_desc);
    let own = base * (1.0 + job_stats.prob_success) * (1.0 + job_stats.time_percentile);

    let mut parent_bonus: f64 = 0.0;
    for parent in &job.parents {
        if !targets.contains(parent) || !cq.job_exists(parent)? {
            continue;
        }
        let p = compute_priority(parent, cq, targets, stats, memo)?;
        parent_bonus = parent_bonus.max(p);
    }

    let mut priority = own + parent_bonus;
    if !priority.is_finite() {
        warn!(job_id = %job_id, priority, "Non-finite priority, using 0");
        priority = 0.0;
    }
    memo.insert(job_id.clone(), priority);
    Ok(priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kiln_core::{Cache, FailureKind, Job, JobTimestamp};
    use kiln_db::MemoryStore;
    use std::sync::Arc;

    fn define(store: &dyn Store, id: &str, children: &[&str], dynamic: bool) {
        let mut job = Job::new(JobId::from(id), "cmd", vec![JobId::root()]);
        job.needs_context = dynamic;
        job.children = children.iter().map(|c| JobId::from(*c)).collect();
        db::set_job(store, &job).unwrap();
        for child in children {
            db::db_job_add_parent(store, &JobId::from(*child), &job.job_id).unwrap();
        }
    }

    fn all(names: &[&str]) -> BTreeSet<JobId> {
        names.iter().map(|n| JobId::from(*n)).collect()
    }

    fn priority_of(cq: &mut CacheQueryDB, id: &str, targets: &BTreeSet<JobId>) -> f64 {
        let mut memo = HashMap::new();
        let stats = HistoryStats::default();
        compute_priority(&JobId::from(id), cq, targets, &stats, &mut memo).unwrap()
    }

    #[test]
    fn test_priority_grows_towards_the_leaves() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        define(store.as_ref(), "a", &[], false);
        define(store.as_ref(), "b", &["a"], false);
        define(store.as_ref(), "c", &["b"], false);
        let targets = all(&["a", "b", "c"]);
        let mut cq = CacheQueryDB::new(store, false);

        let pc = priority_of(&mut cq, "c", &targets);
        let pb = priority_of(&mut cq, "b", &targets);
        let pa = priority_of(&mut cq, "a", &targets);
        assert!(pa > pb && pb > pc);
        assert!((pc - 1.95 * 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_parents_outside_targets_do_not_count() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        define(store.as_ref(), "a", &[], false);
        define(store.as_ref(), "b", &["a"], false);
        let mut cq = CacheQueryDB::new(store, false);
        let alone = priority_of(&mut cq, "a", &all(&["a"]));
        let with_parent = priority_of(&mut cq, "a", &all(&["a", "b"]));
        assert!(with_parent > alone);
    }

    #[test]
    fn test_dynamic_jobs_first_and_shallow_before_deep() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        define(store.as_ref(), "d", &[], true);
        let mut nested = Job::new(
            JobId::from("n"),
            "cmd",
            vec![JobId::root(), JobId::from("d")],
        );
        nested.needs_context = true;
        db::set_job(store.as_ref(), &nested).unwrap();
        define(store.as_ref(), "s", &[], false);

        let targets = all(&["d", "n", "s"]);
        let mut cq = CacheQueryDB::new(store, false);
        assert_eq!(priority_of(&mut cq, "d", &targets), DYNAMIC_BASE_PRIORITY);
        assert_eq!(priority_of(&mut cq, "n", &targets), DYNAMIC_BASE_PRIORITY - 1.0);
        assert!(priority_of(&mut cq, "s", &targets) < DYNAMIC_BASE_PRIORITY - 1.0);
    }

    #[test]
    fn test_failed_jobs_sink() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        for id in ["ok", "failed", "oom"] {
            define(store.as_ref(), id, &[], false);
        }
        db::set_job_cache(store.as_ref(), &JobId::from("failed"), &Cache::new(CacheState::Failed))
            .unwrap();
        let mut oom = Cache::new(CacheState::Failed);
        oom.failure_kind = Some(FailureKind::OutOfMemory);
        db::set_job_cache(store.as_ref(), &JobId::from("oom"), &oom).unwrap();

        let targets = all(&["ok", "failed", "oom"]);
        let mut cq = CacheQueryDB::new(store, false);
        let ok = priority_of(&mut cq, "ok", &targets);
        let failed = priority_of(&mut cq, "failed", &targets);
        let oom = priority_of(&mut cq, "oom", &targets);
        assert!(ok > failed && failed > oom);
    }

    #[test]
    fn test_history_stats() {
        let store = MemoryStore::new();
        for id in ["fast", "slow", "broken"] {
            define(&store, id, &[], false);
        }
        for (id, walltime) in [("fast", 1.0), ("slow", 10.0)] {
            let mut cache = Cache::new(CacheState::Done);
            cache.timestamp = JobTimestamp::At(Utc::now());
            cache.walltime_used = Some(walltime);
            db::set_job_cache(&store, &JobId::from(id), &cache).unwrap();
        }
        db::set_job_cache(&store, &JobId::from("broken"), &Cache::new(CacheState::Failed))
            .unwrap();

        let stats = HistoryStats::from_store(&store).unwrap();
        let command = &stats.by_command["cmd"];
        assert!((command.prob_success - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.lookup(&JobId::from("fast"), "cmd").time_percentile, 0.0);
        assert_eq!(stats.lookup(&JobId::from("slow"), "cmd").time_percentile, 1.0);
        assert_eq!(stats.lookup(&JobId::from("new"), "other"), JobStats::default());
    }
}
