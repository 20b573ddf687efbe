//! Optimistic read-modify-write on job definitions.
//!
//! Several workers may update the same definition (parent edges, dynamic
//! children) concurrently. The store only guarantees single-key atomicity, so
//! an update is written, read back, and re-applied on top of whatever another
//! writer left behind until the stored record reflects it.

use kiln_core::{Error, Job, JobId, Result, Store};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::storage::{get_job, set_job};

const MAX_ATTEMPTS: usize = 10;

/// Apply `apply` to the stored definition of `job_id` until the change sticks.
///
/// `apply` must be idempotent: it is re-run on the concurrently modified
/// record whenever the read-back does not match what was written.
pub fn update_job_with_retry<F>(store: &dyn Store, job_id: &JobId, apply: F) -> Result<Job>
where
    F: Fn(&mut Job),
{
    let mut job = get_job(store, job_id)?;
    for attempt in 1..=MAX_ATTEMPTS {
        apply(&mut job);
        set_job(store, &job)?;

        let stored = get_job(store, job_id)?;
        if stored == job {
            return Ok(job);
        }
        debug!(job_id = %job_id, attempt, "Concurrent update detected, re-applying");
        job = stored;
    }
    warn!(job_id = %job_id, "Giving up on concurrent update");
    Err(Error::bug(format!(
        "could not update job {} after {} attempts",
        job_id, MAX_ATTEMPTS
    )))
}

/// Record `parent` in the parents of `child`.
pub fn db_job_add_parent(store: &dyn Store, child: &JobId, parent: &JobId) -> Result<()> {
    update_job_with_retry(store, child, |job| {
        job.parents.insert(parent.clone());
    })?;
    Ok(())
}

/// Record `children` as dependencies of `parent` discovered in the result of
/// `returned_by`.
pub fn db_job_add_dynamic_children(
    store: &dyn Store,
    parent: &JobId,
    returned_by: &JobId,
    children: &BTreeSet<JobId>,
) -> Result<()> {
    update_job_with_retry(store, parent, |job| {
        job.add_dynamic_children(returned_by, children);
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use kiln_core::StoreError;
    use kiln_core::store::keys;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(id: &str) -> Job {
        Job::new(JobId::from(id), "cmd", vec![JobId::root()])
    }

    /// Simulates another writer that overwrites the record right after our
    /// first write, dropping our change and adding its own parent.
    struct InterferingStore {
        inner: MemoryStore,
        interfere_on_write: usize,
        writes: AtomicUsize,
    }

    impl Store for InterferingStore {
        fn name(&self) -> &'static str {
            "interfering"
        }

        fn get(&self, key: &str) -> std::result::Result<Vec<u8>, StoreError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> std::result::Result<(), StoreError> {
            self.inner.set(key, value)?;
            let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.interfere_on_write {
                let mut other = job("c");
                other.parents.insert(JobId::from("other-writer"));
                let bytes = serde_json::to_vec(&other).map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    message: e.to_string(),
                })?;
                self.inner.set(key, &bytes)?;
            }
            Ok(())
        }

        fn remove(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.inner.remove(key)
        }

        fn contains(&self, key: &str) -> std::result::Result<bool, StoreError> {
            self.inner.contains(key)
        }

        fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, StoreError> {
            self.inner.list(prefix)
        }

        fn sizeof(&self, key: &str) -> std::result::Result<u64, StoreError> {
            self.inner.sizeof(key)
        }
    }

    #[test]
    fn test_add_parent() {
        let store = MemoryStore::new();
        set_job(&store, &job("a")).unwrap();
        db_job_add_parent(&store, &JobId::from("a"), &JobId::from("b")).unwrap();
        assert!(get_job(&store, &JobId::from("a")).unwrap().parents.contains("b"));
    }

    #[test]
    fn test_lost_update_is_merged() {
        let store = InterferingStore {
            inner: MemoryStore::new(),
            interfere_on_write: 2,
            writes: AtomicUsize::new(0),
        };
        set_job(&store, &job("c")).unwrap();

        let merged = update_job_with_retry(&store, &JobId::from("c"), |j| {
            j.parents.insert(JobId::from("mine"));
        })
        .unwrap();

        assert!(merged.parents.contains("mine"));
        assert!(merged.parents.contains("other-writer"));
        let stored = get_job(&store, &JobId::from("c")).unwrap();
        assert_eq!(stored, merged);
        assert!(store.inner.contains(&keys::job(&JobId::from("c"))).unwrap());
    }

    #[test]
    fn test_dynamic_children_extend_children() {
        let store = MemoryStore::new();
        set_job(&store, &job("p")).unwrap();
        let found: BTreeSet<JobId> = [JobId::from("x"), JobId::from("y")].into();
        db_job_add_dynamic_children(&store, &JobId::from("p"), &JobId::from("d"), &found).unwrap();

        let p = get_job(&store, &JobId::from("p")).unwrap();
        assert_eq!(p.dynamic_children[&JobId::from("d")], found);
        assert!(p.children.is_superset(&found));
        assert!(p.check_invariants().is_ok());
    }

    #[test]
    fn test_missing_job() {
        let store = MemoryStore::new();
        let err = db_job_add_parent(&store, &JobId::from("ghost"), &JobId::from("p")).unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));
    }
}
