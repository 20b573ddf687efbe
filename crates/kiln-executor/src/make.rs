//! The worker-side action: run one job and record the outcome in the store.

use chrono::Utc;
use kiln_core::promise::collect_promises;
use kiln_core::{
    Cache, CacheState, Error, FailureKind, JobCompletion, JobFailure, JobId, JobTimestamp,
    MakeOutcome, Result, Store,
};
use kiln_db as db;
use kiln_db_queries::delete_jobs_cascading;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{CommandError, ComputeError, Context, job_compute};

/// Name of the host running jobs, as recorded in caches.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn bug(job_id: &JobId, e: Error) -> JobFailure {
    error!(job_id = %job_id, error = %e, "Internal error while making job");
    JobFailure::Bug {
        job_id: job_id.clone(),
        message: e.to_string(),
    }
}

/// Run `job_id` and persist its result or failure.
///
/// On success the result is stored, jobs the previous run defined but this
/// one did not are deleted, and the cache becomes DONE. On failure the jobs
/// declared during the attempt are deleted and the cache becomes FAILED. An
/// interrupted run rolls back the same way and leaves the job not started.
pub async fn make(job_id: &JobId, context: &Context) -> JobCompletion {
    let store = context.store().clone();
    let host = hostname();

    let job = db::get_job(store.as_ref(), job_id).map_err(|e| bug(job_id, e))?;
    let previous = db::get_job_cache(store.as_ref(), job_id).map_err(|e| bug(job_id, e))?;

    let started = Utc::now();
    let mut processing = Cache::new(CacheState::Processing);
    processing.timestamp_started = Some(started);
    processing.host = Some(host.clone());
    db::set_job_cache(store.as_ref(), job_id, &processing).map_err(|e| bug(job_id, e))?;

    info!(job_id = %job_id, host = %host, "Making job");
    let wall_start = Instant::now();
    let computed = job_compute(&job, context).await;
    let walltime = wall_start.elapsed().as_secs_f64();

    let (source, new_jobs) = match computed {
        Ok(output) => {
            let deps = collect_promises(&output.user_object);
            let mut missing = Vec::new();
            for dep in &deps {
                if !db::job_exists(store.as_ref(), dep).map_err(|e| bug(job_id, e))? {
                    missing.push(dep.to_string());
                }
            }
            if missing.is_empty() {
                let mut cache = Cache::new(CacheState::Done);
                cache.timestamp_started = Some(started);
                cache.host = Some(host);
                cache.walltime_used = Some(walltime);
                cache.cputime_used = Some(output.int_compute.as_secs_f64());
                let done = Done {
                    user_object: output.user_object,
                    new_jobs: output.new_jobs,
                    user_object_deps: deps,
                    previously_defined: previous.jobs_defined,
                    cache,
                };
                return finish_success(context, job_id, done).map_err(|e| bug(job_id, e));
            }
            (
                CommandError::failed(format!(
                    "result references undefined jobs: {}",
                    missing.join(", ")
                )),
                output.new_jobs,
            )
        }
        Err(ComputeError::Command { source, new_jobs }) => (source, new_jobs),
        Err(ComputeError::Internal(Error::Interrupted(_))) => {
            (CommandError::Interrupted, BTreeSet::new())
        }
        Err(ComputeError::Internal(e)) if e.is_bug() => return Err(bug(job_id, e)),
        Err(ComputeError::Internal(e)) => (CommandError::failed(e.to_string()), BTreeSet::new()),
    };

    let mut cq = context.query();
    let deleted_jobs = delete_jobs_cascading(&mut cq, &new_jobs).map_err(|e| bug(job_id, e))?;

    if let CommandError::Interrupted = source {
        warn!(job_id = %job_id, "Job interrupted, rolling back");
        db::delete_job_cache(store.as_ref(), job_id).map_err(|e| bug(job_id, e))?;
        return Err(JobFailure::Interrupted {
            job_id: job_id.clone(),
            deleted_jobs,
        });
    }

    let kind = match source {
        CommandError::OutOfMemory(_) => FailureKind::OutOfMemory,
        _ => FailureKind::Error,
    };
    let reason = source.to_string();
    let backtrace = Some(format!("{:?}", source));
    warn!(job_id = %job_id, reason = %reason, "Job failed");

    let mut cache = Cache::new(CacheState::Failed);
    cache.timestamp_started = Some(started);
    cache.host = Some(host);
    cache.walltime_used = Some(walltime);
    cache.exception = Some(reason.clone());
    cache.backtrace = backtrace.clone();
    cache.failure_kind = Some(kind);
    db::set_job_cache(store.as_ref(), job_id, &cache).map_err(|e| bug(job_id, e))?;

    Err(JobFailure::Failed {
        job_id: job_id.clone(),
        reason,
        backtrace,
        deleted_jobs,
    })
}

struct Done {
    user_object: serde_json::Value,
    new_jobs: BTreeSet<JobId>,
    user_object_deps: BTreeSet<JobId>,
    previously_defined: BTreeSet<JobId>,
    cache: Cache,
}

fn finish_success(context: &Context, job_id: &JobId, done: Done) -> Result<MakeOutcome> {
    let Done {
        user_object,
        new_jobs,
        user_object_deps,
        previously_defined,
        mut cache,
    } = done;
    let store = context.store();
    db::set_job_userobject(store.as_ref(), job_id, &user_object)?;

    let stale: BTreeSet<JobId> = previously_defined.difference(&new_jobs).cloned().collect();
    let deleted_jobs = if stale.is_empty() {
        BTreeSet::new()
    } else {
        debug!(job_id = %job_id, stale = stale.len(), "Deleting jobs no longer defined");
        let mut cq = context.query();
        delete_jobs_cascading(&mut cq, &stale)?
    };

    cache.timestamp = JobTimestamp::At(Utc::now());
    cache.jobs_defined = new_jobs.clone();
    db::set_job_cache(store.as_ref(), job_id, &cache)?;
    info!(job_id = %job_id, new_jobs = new_jobs.len(), "Job done");

    Ok(MakeOutcome {
        new_jobs,
        deleted_jobs,
        user_object_deps,
    })
}

/// Record a failure decided outside the job itself (timeouts, host failures).
pub fn mark_as_failed(
    store: &dyn Store,
    job_id: &JobId,
    reason: &str,
    backtrace: Option<String>,
    kind: FailureKind,
) -> Result<()> {
    let mut cache = db::get_job_cache(store, job_id)?;
    cache.state = CacheState::Failed;
    cache.timestamp = JobTimestamp::Never;
    cache.jobs_defined.clear();
    cache.exception = Some(reason.to_string());
    cache.backtrace = backtrace;
    cache.failure_kind = Some(kind);
    db::set_job_cache(store, job_id, &cache)
}

/// Record that `job_id` cannot run because `blocking` failed.
pub fn mark_as_blocked(store: &dyn Store, job_id: &JobId, blocking: &JobId) -> Result<()> {
    let mut cache = Cache::new(CacheState::Blocked);
    cache.exception = Some(format!("blocked by failure of {}", blocking));
    db::set_job_cache(store, job_id, &cache)
}
