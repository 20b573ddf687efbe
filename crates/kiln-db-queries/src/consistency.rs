//! Store-wide audit of the job graph.

use kiln_core::store::keys;
use kiln_core::{JobId, Result, Store};
use kiln_db as db;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Check every storage invariant and describe each violation found.
///
/// An empty list means the store is consistent.
pub fn check_consistency(store: &dyn Store) -> Result<Vec<String>> {
    let mut problems = Vec::new();
    let jobs: BTreeSet<JobId> = db::all_jobs(store)?.into_iter().collect();

    for job_id in &jobs {
        let job = db::get_job(store, job_id)?;
        if let Err(e) = job.check_invariants() {
            problems.push(e.to_string());
        }

        for child in &job.children {
            if !jobs.contains(child) {
                problems.push(format!("job {} depends on missing job {}", job_id, child));
                continue;
            }
            let child_job = db::get_job(store, child)?;
            if !child_job.parents.contains(job_id) {
                problems.push(format!(
                    "job {} is missing parent edge to {}",
                    child, job_id
                ));
            }
        }

        let cache = db::get_job_cache(store, job_id)?;
        if cache.is_done() {
            if !db::job_userobject_exists(store, job_id)? {
                problems.push(format!("job {} is done but has no result", job_id));
            }
            for defined in &cache.jobs_defined {
                if !jobs.contains(defined) {
                    problems.push(format!(
                        "job {} lists missing job {} as defined",
                        job_id, defined
                    ));
                }
            }
        }
    }

    for (prefix, what) in [
        (keys::CACHE_PREFIX, "cache"),
        (keys::ARGS_PREFIX, "arguments"),
        (keys::RESULT_PREFIX, "result"),
    ] {
        for key in store.list(prefix)? {
            let Some(id) = key.strip_prefix(prefix) else {
                continue;
            };
            if !jobs.contains(id) {
                problems.push(format!("{} record for undefined job {}", what, id));
            }
        }
    }

    if problems.is_empty() {
        info!(jobs = jobs.len(), "Store is consistent");
    } else {
        for problem in &problems {
            warn!(problem = %problem, "Inconsistency");
        }
    }
    Ok(problems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::tests::{define, mark_done};
    use chrono::Utc;
    use kiln_core::{Cache, CacheState, JobArgs};
    use kiln_db::MemoryStore;

    #[test]
    fn test_consistent_store() {
        let store = MemoryStore::new();
        define(&store, "a", &[]);
        define(&store, "b", &["a"]);
        mark_done(&store, "a", Utc::now());
        assert!(check_consistency(&store).unwrap().is_empty());
    }

    #[test]
    fn test_reports_each_violation() {
        let store = MemoryStore::new();
        define(&store, "a", &[]);
        define(&store, "b", &["a", "ghost"]);
        // drop the parent edge a -> b
        let mut a = db::get_job(&store, &JobId::from("a")).unwrap();
        a.parents.clear();
        db::set_job(&store, &a).unwrap();
        db::set_job_cache(&store, &JobId::from("a"), &Cache::new(CacheState::Done)).unwrap();
        db::set_job_args(&store, &JobId::from("orphan"), &JobArgs::new("cmd")).unwrap();

        let problems = check_consistency(&store).unwrap();
        assert_eq!(problems.len(), 4, "{:?}", problems);
        assert!(problems.iter().any(|p| p.contains("missing job ghost")));
        assert!(problems.iter().any(|p| p.contains("missing parent edge")));
        assert!(problems.iter().any(|p| p.contains("no result")));
        assert!(problems.iter().any(|p| p.contains("undefined job orphan")));
    }
}
