//! Invalidation and deletion of jobs.

use kiln_core::{CacheState, JobId, JobTimestamp, Result};
use kiln_db as db;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::CacheQueryDB;

/// What [`clean_targets`] did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanReport {
    /// Jobs removed entirely: everything the cleaned dynamic jobs defined.
    pub deleted: BTreeSet<JobId>,
    /// Jobs whose cache was dropped.
    pub cleaned: BTreeSet<JobId>,
    /// Jobs whose result-discovered dependencies were detached from their parents.
    pub relations_cleaned: BTreeSet<JobId>,
}

/// Forget the results of `job_ids` so they are recomputed on the next run.
///
/// Jobs defined by the cleaned jobs (the definition closure) are deleted
/// outright, since re-running their definer will declare them again. The
/// cleaned jobs keep their definitions and lose only their cache.
pub fn clean_targets(cq: &mut CacheQueryDB, job_ids: &BTreeSet<JobId>) -> Result<CleanReport> {
    let closure = cq.definition_closure(job_ids)?;
    let basic: BTreeSet<JobId> = job_ids.difference(&closure).cloned().collect();

    let mut other_clean = BTreeSet::new();
    for job_id in job_ids {
        if cq.job_exists(job_id)? {
            other_clean.extend(cq.parents(job_id)?);
        }
    }
    let other_clean: BTreeSet<JobId> = other_clean.difference(&closure).cloned().collect();

    let mut report = CleanReport::default();
    for job_id in closure.iter().chain(&basic).chain(&other_clean) {
        if clean_cache_relations(cq, job_id)? {
            report.relations_cleaned.insert(job_id.clone());
        }
    }
    cq.invalidate();

    report.deleted = delete_jobs_cascading(cq, &closure)?;
    for job_id in &basic {
        db::delete_job_cache(cq.store(), job_id)?;
        report.cleaned.insert(job_id.clone());
    }
    cq.invalidate();

    info!(
        cleaned = report.cleaned.len(),
        deleted = report.deleted.len(),
        "Cleaned targets"
    );
    Ok(report)
}

/// Detach the dependencies discovered in the result of `job_id` from its
/// parents. Returns whether anything changed.
///
/// Only a DONE job can have contributed such dependencies.
pub fn clean_cache_relations(cq: &mut CacheQueryDB, job_id: &JobId) -> Result<bool> {
    if !cq.job_exists(job_id)? || !cq.get_job_cache(job_id)?.is_done() {
        return Ok(false);
    }
    let mut changed = false;
    for parent in cq.direct_parents(job_id)? {
        if !cq.job_exists(&parent)? {
            continue;
        }
        if !cq.get_job(&parent)?.dynamic_children.contains_key(job_id) {
            continue;
        }
        debug!(job_id = %job_id, parent = %parent, "Removing dynamic children");
        let declared = if db::job_args_exists(cq.store(), &parent)? {
            db::get_job_args(cq.store(), &parent)?.declared_dependencies()
        } else {
            BTreeSet::new()
        };
        db::update_job_with_retry(cq.store(), &parent, |p| {
            if let Some(dynamic) = p.dynamic_children.remove(job_id) {
                let still_dynamic: BTreeSet<JobId> =
                    p.dynamic_children.values().flatten().cloned().collect();
                p.children.retain(|c| {
                    !dynamic.contains(c) || declared.contains(c) || still_dynamic.contains(c)
                });
            }
        })?;
        changed = true;
    }
    Ok(changed)
}

/// Delete `job_ids` together with everything they (transitively) defined.
///
/// Parent edges pointing at deleted jobs are removed from the surviving
/// children. Returns the ids that were actually deleted.
pub fn delete_jobs_cascading(
    cq: &mut CacheQueryDB,
    job_ids: &BTreeSet<JobId>,
) -> Result<BTreeSet<JobId>> {
    let mut doomed = cq.definition_closure(job_ids)?;
    doomed.extend(job_ids.iter().cloned());

    let mut deleted = BTreeSet::new();
    for job_id in &doomed {
        if !cq.job_exists(job_id)? {
            continue;
        }
        let job = cq.get_job(job_id)?;
        for child in job.children.difference(&doomed) {
            if !db::job_exists(cq.store(), child)? {
                continue;
            }
            db::update_job_with_retry(cq.store(), child, |c| {
                c.parents.remove(job_id);
            })?;
        }
        db::delete_all_job_data(cq.store(), job_id)?;
        deleted.insert(job_id.clone());
    }
    cq.invalidate();

    if !deleted.is_empty() {
        debug!(count = deleted.len(), "Deleted jobs");
    }
    Ok(deleted)
}

/// Delete every job `job_id` defined, directly or through the dynamic jobs
/// it defined.
///
/// Used when an attempt of a dynamic job is abandoned before it could report
/// what it declared.
pub fn delete_jobs_defined_by(cq: &mut CacheQueryDB, job_id: &JobId) -> Result<BTreeSet<JobId>> {
    let mut defined = BTreeSet::new();
    for candidate in cq.all_jobs()? {
        if cq.get_job(&candidate)?.defined_by.contains(job_id) {
            defined.insert(candidate);
        }
    }
    if defined.is_empty() {
        return Ok(defined);
    }
    debug!(job_id = %job_id, count = defined.len(), "Rolling back defined jobs");
    delete_jobs_cascading(cq, &defined)
}

/// Flag a DONE job so the next run recomputes it. Returns whether the job was
/// DONE.
pub fn mark_to_remake(cq: &mut CacheQueryDB, job_id: &JobId) -> Result<bool> {
    let mut cache = cq.get_job_cache(job_id)?;
    if cache.state != CacheState::Done {
        return Ok(false);
    }
    cache.timestamp = JobTimestamp::ForceRemake;
    db::set_job_cache(cq.store(), job_id, &cache)?;
    cq.invalidate();
    Ok(true)
}
