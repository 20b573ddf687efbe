//! Typed accessors for the per-job records.

use kiln_core::promise::substitute_promises;
use kiln_core::store::keys;
use kiln_core::{Cache, Error, Job, JobArgs, JobId, Result, Store, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

fn load<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<T> {
    let bytes = store.get(key)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        Error::Store(StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })
    })
}

fn save<T: Serialize>(store: &dyn Store, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, &bytes)?;
    Ok(())
}

fn not_found_as_job(err: Error, job_id: &JobId) -> Error {
    match err {
        Error::Store(StoreError::NotFound(_)) => Error::JobNotFound(job_id.clone()),
        other => other,
    }
}

// Definitions

pub fn job_exists(store: &dyn Store, job_id: &JobId) -> Result<bool> {
    Ok(store.contains(&keys::job(job_id))?)
}

pub fn get_job(store: &dyn Store, job_id: &JobId) -> Result<Job> {
    load(store, &keys::job(job_id)).map_err(|e| not_found_as_job(e, job_id))
}

pub fn set_job(store: &dyn Store, job: &Job) -> Result<()> {
    save(store, &keys::job(&job.job_id), job)
}

pub fn delete_job(store: &dyn Store, job_id: &JobId) -> Result<()> {
    Ok(store.remove(&keys::job(job_id))?)
}

/// Every defined job, sorted by id.
pub fn all_jobs(store: &dyn Store) -> Result<Vec<JobId>> {
    Ok(store
        .list(keys::JOB_PREFIX)?
        .into_iter()
        .filter_map(|k| k.strip_prefix(keys::JOB_PREFIX).map(JobId::from))
        .collect())
}

// Caches

pub fn job_cache_exists(store: &dyn Store, job_id: &JobId) -> Result<bool> {
    Ok(store.contains(&keys::cache(job_id))?)
}

/// The cache of a job; a missing record reads as `NotStarted`.
pub fn get_job_cache(store: &dyn Store, job_id: &JobId) -> Result<Cache> {
    match load(store, &keys::cache(job_id)) {
        Ok(cache) => Ok(cache),
        Err(Error::Store(StoreError::NotFound(_))) => Ok(Cache::default()),
        Err(e) => Err(e),
    }
}

pub fn set_job_cache(store: &dyn Store, job_id: &JobId, cache: &Cache) -> Result<()> {
    save(store, &keys::cache(job_id), cache)
}

pub fn delete_job_cache(store: &dyn Store, job_id: &JobId) -> Result<()> {
    Ok(store.remove(&keys::cache(job_id))?)
}

// Arguments

pub fn job_args_exists(store: &dyn Store, job_id: &JobId) -> Result<bool> {
    Ok(store.contains(&keys::args(job_id))?)
}

pub fn get_job_args(store: &dyn Store, job_id: &JobId) -> Result<JobArgs> {
    load(store, &keys::args(job_id)).map_err(|e| not_found_as_job(e, job_id))
}

pub fn set_job_args(store: &dyn Store, job_id: &JobId, args: &JobArgs) -> Result<()> {
    save(store, &keys::args(job_id), args)
}

pub fn delete_job_args(store: &dyn Store, job_id: &JobId) -> Result<()> {
    Ok(store.remove(&keys::args(job_id))?)
}

// Results

pub fn job_userobject_exists(store: &dyn Store, job_id: &JobId) -> Result<bool> {
    Ok(store.contains(&keys::result(job_id))?)
}

pub fn get_job_userobject(store: &dyn Store, job_id: &JobId) -> Result<Value> {
    load(store, &keys::result(job_id)).map_err(|e| match e {
        Error::Store(StoreError::NotFound(_)) => {
            Error::bug(format!("job {} has no stored result", job_id))
        }
        other => other,
    })
}

pub fn set_job_userobject(store: &dyn Store, job_id: &JobId, value: &Value) -> Result<()> {
    save(store, &keys::result(job_id), value)
}

pub fn delete_job_userobject(store: &dyn Store, job_id: &JobId) -> Result<()> {
    Ok(store.remove(&keys::result(job_id))?)
}

/// The stored result of a job with every embedded promise replaced by the
/// (recursively resolved) result it refers to.
pub fn get_job_userobject_resolved(store: &dyn Store, job_id: &JobId) -> Result<Value> {
    let mut resolving = HashSet::new();
    resolve_userobject(store, job_id, &mut resolving)
}

fn resolve_userobject(
    store: &dyn Store,
    job_id: &JobId,
    resolving: &mut HashSet<JobId>,
) -> Result<Value> {
    if !resolving.insert(job_id.clone()) {
        return Err(Error::CycleDetected(format!(
            "result of {} refers back to itself",
            job_id
        )));
    }
    let raw = get_job_userobject(store, job_id)?;
    let resolved = substitute_promises(&raw, &mut |dep: &JobId| {
        resolve_userobject(store, dep, resolving)
    });
    resolving.remove(job_id);
    resolved
}

/// Remove every record of a job.
pub fn delete_all_job_data(store: &dyn Store, job_id: &JobId) -> Result<()> {
    debug!(job_id = %job_id, "Deleting all job data");
    delete_job_args(store, job_id)?;
    delete_job_userobject(store, job_id)?;
    delete_job_cache(store, job_id)?;
    delete_job(store, job_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FsStore, MemoryStore};
    use chrono::Utc;
    use kiln_core::{CacheState, JobTimestamp, Promise};
    use serde_json::json;

    fn job(id: &str) -> Job {
        Job::new(JobId::from(id), "cmd", vec![JobId::root()])
    }

    #[test]
    fn test_missing_cache_is_not_started() {
        let store = MemoryStore::new();
        let cache = get_job_cache(&store, &JobId::from("nope")).unwrap();
        assert_eq!(cache.state, CacheState::NotStarted);
    }

    #[test]
    fn test_missing_job_is_job_not_found() {
        let store = MemoryStore::new();
        let err = get_job(&store, &JobId::from("nope")).unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));
    }

    #[test]
    fn test_missing_result_is_bug() {
        let store = MemoryStore::new();
        let err = get_job_userobject(&store, &JobId::from("nope")).unwrap_err();
        assert!(err.is_bug());
    }

    #[test]
    fn test_corrupt_record() {
        let store = MemoryStore::new();
        store.set("cm-job-x", b"{not json").unwrap();
        let err = get_job(&store, &JobId::from("x")).unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_records_survive_reopening_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let id = JobId::from("b");

        let mut definition = job("b");
        definition.children.insert(JobId::from("a"));
        definition.parents.insert(JobId::from("c"));
        definition.needs_context = true;
        let mut cache = Cache::new(CacheState::Done);
        cache.timestamp = JobTimestamp::At(Utc::now());
        cache.jobs_defined.insert(JobId::from("b-child"));
        {
            let store = FsStore::open(dir.path()).unwrap();
            set_job(&store, &definition).unwrap();
            set_job_cache(&store, &id, &cache).unwrap();
            set_job_userobject(&store, &id, &json!({"answer": 42})).unwrap();
        }

        let store = FsStore::open(dir.path()).unwrap();
        assert_eq!(get_job(&store, &id).unwrap(), definition);
        assert_eq!(get_job_cache(&store, &id).unwrap(), cache);
        assert_eq!(get_job_userobject(&store, &id).unwrap(), json!({"answer": 42}));
        assert_eq!(all_jobs(&store).unwrap(), vec![id]);
    }

    #[test]
    fn test_resolved_userobject_follows_promises() {
        let store = MemoryStore::new();
        let a = JobId::from("a");
        let b = JobId::from("b");
        set_job_userobject(&store, &a, &json!(7)).unwrap();
        set_job_userobject(&store, &b, &json!([Value::from(Promise::new(a.clone())), 1]))
            .unwrap();
        assert_eq!(get_job_userobject_resolved(&store, &b).unwrap(), json!([7, 1]));
    }

    #[test]
    fn test_resolved_userobject_detects_cycles() {
        let store = MemoryStore::new();
        let a = JobId::from("a");
        set_job_userobject(&store, &a, &Value::from(Promise::new(a.clone()))).unwrap();
        assert!(matches!(
            get_job_userobject_resolved(&store, &a),
            Err(Error::CycleDetected(_))
        ));
    }

    #[test]
    fn test_delete_all_job_data() {
        let store = MemoryStore::new();
        let id = JobId::from("x");
        set_job(&store, &job("x")).unwrap();
        set_job_cache(&store, &id, &Cache::new(CacheState::Done)).unwrap();
        set_job_args(&store, &id, &JobArgs::new("cmd")).unwrap();
        set_job_userobject(&store, &id, &json!(null)).unwrap();

        delete_all_job_data(&store, &id).unwrap();
        assert!(store.is_empty());
    }
}
