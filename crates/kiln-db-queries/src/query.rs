//! Memoized read-only view of the job graph.

use chrono::{DateTime, Utc};
use kiln_core::promise::collect_promises;
use kiln_core::{Cache, CacheState, Error, Job, JobId, JobTimestamp, Result, Store};
use kiln_db as db;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Answer of [`CacheQueryDB::up_to_date`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpToDate {
    pub up_to_date: bool,
    /// Human-readable explanation, e.g. which child is stale.
    pub reason: String,
    /// Completion time of the job, when it is DONE.
    pub timestamp: Option<DateTime<Utc>>,
}

impl UpToDate {
    fn yes(timestamp: DateTime<Utc>) -> Self {
        Self {
            up_to_date: true,
            reason: "up to date".to_string(),
            timestamp: Some(timestamp),
        }
    }

    fn no(reason: impl Into<String>, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            up_to_date: false,
            reason: reason.into(),
            timestamp,
        }
    }
}

/// Classification of the dependency closure of a set of targets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TodoTargets {
    /// Jobs that must be (re)computed.
    pub todo: BTreeSet<JobId>,
    /// Up-to-date jobs reached from the targets.
    pub done: BTreeSet<JobId>,
    /// The subset of `todo` whose children are all in `done`.
    pub ready: BTreeSet<JobId>,
}

/// Per-session memoized queries over a [`Store`].
///
/// Answers are cached until [`CacheQueryDB::invalidate`] is called; callers
/// that write to the store must invalidate (or use a fresh instance) before
/// querying again.
pub struct CacheQueryDB {
    store: Arc<dyn Store>,
    tolerate_db_inconsistencies: bool,
    jobs: HashMap<JobId, Job>,
    caches: HashMap<JobId, Cache>,
    exists: HashMap<JobId, bool>,
    all_jobs: Option<Vec<JobId>>,
    up_to_date: HashMap<JobId, UpToDate>,
    parents: HashMap<JobId, BTreeSet<JobId>>,
    in_progress: HashSet<JobId>,
}

impl CacheQueryDB {
    pub fn new(store: Arc<dyn Store>, tolerate_db_inconsistencies: bool) -> Self {
        Self {
            store,
            tolerate_db_inconsistencies,
            jobs: HashMap::new(),
            caches: HashMap::new(),
            exists: HashMap::new(),
            all_jobs: None,
            up_to_date: HashMap::new(),
            parents: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn store_arc(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn tolerates_inconsistencies(&self) -> bool {
        self.tolerate_db_inconsistencies
    }

    /// Drop every memoized answer.
    pub fn invalidate(&mut self) {
        self.jobs.clear();
        self.caches.clear();
        self.exists.clear();
        self.all_jobs = None;
        self.up_to_date.clear();
        self.parents.clear();
        self.in_progress.clear();
    }

    pub fn job_exists(&mut self, job_id: &JobId) -> Result<bool> {
        if let Some(exists) = self.exists.get(job_id) {
            return Ok(*exists);
        }
        let exists = db::job_exists(self.store.as_ref(), job_id)?;
        self.exists.insert(job_id.clone(), exists);
        Ok(exists)
    }

    pub fn get_job(&mut self, job_id: &JobId) -> Result<Job> {
        if let Some(job) = self.jobs.get(job_id) {
            return Ok(job.clone());
        }
        let job = db::get_job(self.store.as_ref(), job_id)?;
        self.jobs.insert(job_id.clone(), job.clone());
        self.exists.insert(job_id.clone(), true);
        Ok(job)
    }

    pub fn get_job_cache(&mut self, job_id: &JobId) -> Result<Cache> {
        if let Some(cache) = self.caches.get(job_id) {
            return Ok(cache.clone());
        }
        let cache = db::get_job_cache(self.store.as_ref(), job_id)?;
        self.caches.insert(job_id.clone(), cache.clone());
        Ok(cache)
    }

    pub fn all_jobs(&mut self) -> Result<Vec<JobId>> {
        if let Some(all) = &self.all_jobs {
            return Ok(all.clone());
        }
        let all = db::all_jobs(self.store.as_ref())?;
        self.all_jobs = Some(all.clone());
        Ok(all)
    }

    pub fn direct_children(&mut self, job_id: &JobId) -> Result<BTreeSet<JobId>> {
        Ok(self.get_job(job_id)?.children)
    }

    pub fn direct_parents(&mut self, job_id: &JobId) -> Result<BTreeSet<JobId>> {
        Ok(self.get_job(job_id)?.parents)
    }

    /// All transitive dependents of `job_id` (not including itself).
    pub fn parents(&mut self, job_id: &JobId) -> Result<BTreeSet<JobId>> {
        if let Some(memo) = self.parents.get(job_id) {
            return Ok(memo.clone());
        }
        self.enter(job_id, "parents")?;
        let result = self.compute_parents(job_id);
        self.in_progress.remove(job_id);
        let result = result?;
        self.parents.insert(job_id.clone(), result.clone());
        Ok(result)
    }

    fn compute_parents(&mut self, job_id: &JobId) -> Result<BTreeSet<JobId>> {
        let mut all = BTreeSet::new();
        for parent in self.direct_parents(job_id)? {
            if !self.job_exists(&parent)? {
                debug!(job_id = %job_id, parent = %parent, "Skipping vanished parent");
                continue;
            }
            all.extend(self.parents(&parent)?);
            all.insert(parent);
        }
        Ok(all)
    }

    /// Whether `job_id` can be skipped: it is DONE, not marked for remake, and
    /// everything it depends on (children and defining jobs) is up to date.
    pub fn up_to_date(&mut self, job_id: &JobId) -> Result<UpToDate> {
        if let Some(memo) = self.up_to_date.get(job_id) {
            return Ok(memo.clone());
        }
        self.enter(job_id, "up_to_date")?;
        let result = self.compute_up_to_date(job_id);
        self.in_progress.remove(job_id);
        let result = result?;
        self.up_to_date.insert(job_id.clone(), result.clone());
        Ok(result)
    }

    fn compute_up_to_date(&mut self, job_id: &JobId) -> Result<UpToDate> {
        let cache = self.get_job_cache(job_id)?;
        match cache.state {
            CacheState::Done => {}
            other => return Ok(UpToDate::no(format!("job is {}", other), None)),
        }
        let timestamp = match cache.timestamp {
            JobTimestamp::At(ts) => ts,
            JobTimestamp::ForceRemake => {
                return Ok(UpToDate::no("marked for remake", None));
            }
            JobTimestamp::Never => {
                return Ok(UpToDate::no("done but never completed", None));
            }
        };

        let job = self.get_job(job_id)?;
        for child in &job.children {
            if !self.check_reference(job_id, child, "child")? {
                continue;
            }
            let child_state = self.up_to_date(child)?;
            if !child_state.up_to_date {
                return Ok(UpToDate::no(
                    format!("child {} is not up to date ({})", child, child_state.reason),
                    Some(timestamp),
                ));
            }
            if child_state.timestamp.is_some_and(|child_ts| child_ts > timestamp) {
                return Ok(UpToDate::no(
                    format!("child {} was updated after this job", child),
                    Some(timestamp),
                ));
            }
        }

        for definer in job.definers() {
            if !self.check_reference(job_id, definer, "defining job")? {
                continue;
            }
            let definer_state = self.up_to_date(definer)?;
            if !definer_state.up_to_date {
                return Ok(UpToDate::no(
                    format!(
                        "defining job {} is not up to date ({})",
                        definer, definer_state.reason
                    ),
                    Some(timestamp),
                ));
            }
        }

        Ok(UpToDate::yes(timestamp))
    }

    /// Whether every child of `job_id` is up to date.
    pub fn dependencies_up_to_date(&mut self, job_id: &JobId) -> Result<bool> {
        for child in self.direct_children(job_id)? {
            if !self.check_reference(job_id, &child, "child")? {
                continue;
            }
            if !self.up_to_date(&child)?.up_to_date {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Walk the dependency closure of `jobs` and split it into the jobs that
    /// must run and those that are up to date. Children of up-to-date jobs are
    /// not visited.
    pub fn list_todo_targets<'a, I>(&mut self, jobs: I) -> Result<TodoTargets>
    where
        I: IntoIterator<Item = &'a JobId>,
    {
        let mut result = TodoTargets::default();
        let mut seen = HashSet::new();
        let mut stack: Vec<JobId> = jobs.into_iter().cloned().collect();

        while let Some(job_id) = stack.pop() {
            if !seen.insert(job_id.clone()) {
                continue;
            }
            if self.up_to_date(&job_id)?.up_to_date {
                result.done.insert(job_id);
                continue;
            }
            for child in self.direct_children(&job_id)? {
                if !self.check_reference(&job_id, &child, "child")? {
                    continue;
                }
                if !seen.contains(&child) {
                    stack.push(child);
                }
            }
            result.todo.insert(job_id);
        }

        for job_id in &result.todo {
            let mut ready = true;
            for child in self.direct_children(job_id)? {
                if !self.check_reference(job_id, &child, "child")? {
                    continue;
                }
                if !result.done.contains(&child) {
                    ready = false;
                    break;
                }
            }
            if ready {
                result.ready.insert(job_id.clone());
            }
        }

        Ok(result)
    }

    /// Transitive dependencies of `job_id`, including the jobs referenced by
    /// promises inside the stored results along the way.
    pub fn tree_children_and_uodeps(&mut self, job_id: &JobId) -> Result<BTreeSet<JobId>> {
        let mut found = BTreeSet::new();
        let mut stack = vec![job_id.clone()];
        while let Some(current) = stack.pop() {
            let mut next = self.direct_children(&current)?;
            if db::job_userobject_exists(self.store.as_ref(), &current)? {
                let value = db::get_job_userobject(self.store.as_ref(), &current)?;
                next.extend(collect_promises(&value));
            }
            for dep in next {
                if !self.check_reference(&current, &dep, "dependency")? {
                    continue;
                }
                if found.insert(dep.clone()) {
                    stack.push(dep);
                }
            }
        }
        Ok(found)
    }

    /// Every job (transitively) defined by the dynamic jobs in `jobs`.
    ///
    /// Only DONE jobs contribute, since `jobs_defined` is only meaningful
    /// after a successful run. The input jobs themselves are part of the
    /// result only when they were defined by one another.
    pub fn definition_closure<'a, I>(&mut self, jobs: I) -> Result<BTreeSet<JobId>>
    where
        I: IntoIterator<Item = &'a JobId>,
    {
        let mut closure = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<JobId> = jobs.into_iter().cloned().collect();

        while let Some(job_id) = stack.pop() {
            if !visited.insert(job_id.clone()) {
                continue;
            }
            if !self.job_exists(&job_id)? {
                continue;
            }
            let cache = self.get_job_cache(&job_id)?;
            if !cache.is_done() {
                continue;
            }
            for defined in cache.jobs_defined {
                closure.insert(defined.clone());
                stack.push(defined);
            }
        }
        Ok(closure)
    }

    fn enter(&mut self, job_id: &JobId, query: &str) -> Result<()> {
        if self.in_progress.insert(job_id.clone()) {
            Ok(())
        } else {
            Err(Error::CycleDetected(format!(
                "{} of {} depends on itself",
                query, job_id
            )))
        }
    }

    /// Whether a referenced job exists. A missing one is a [`Error::Bug`]
    /// unless inconsistencies are tolerated, in which case it is skipped.
    fn check_reference(&mut self, from: &JobId, to: &JobId, what: &str) -> Result<bool> {
        if self.job_exists(to)? {
            return Ok(true);
        }
        if self.tolerate_db_inconsistencies {
            warn!(job_id = %from, missing = %to, "Skipping missing {}", what);
            Ok(false)
        } else {
            Err(Error::bug(format!(
                "job {} references missing {} {}",
                from, what, to
            )))
        }
    }
}
