//! The execution manager.
//!
//! Drives jobs from todo through ready and processing to done, failed or
//! blocked, dispatching ready jobs to a [`Worker`] and folding in the jobs
//! that dynamic jobs define or reference while running.

use kiln_config::KilnConfig;
use kiln_core::{
    Error, Event, EventBus, FailureKind, JobCompletion, JobFailure, JobId, MakeOutcome,
    ResultHandle, Result, Store, Worker,
};
use kiln_db as db;
use kiln_db_queries::{CacheQueryDB, TodoTargets, check_consistency, delete_jobs_defined_by};
use kiln_executor::{mark_as_blocked, mark_as_failed};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::priority::{HistoryStats, compute_priority};
use crate::{JobSets, ReadyQueue};

/// Stops a running manager from another task.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Final state of a manager run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerSummary {
    pub targets: BTreeSet<JobId>,
    pub done: BTreeSet<JobId>,
    pub failed: BTreeSet<JobId>,
    pub blocked: BTreeSet<JobId>,
    pub deleted: BTreeSet<JobId>,
}

impl ManagerSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

struct Running {
    handle: Box<dyn ResultHandle>,
    started: Instant,
}

pub struct Manager {
    store: Arc<dyn Store>,
    worker: Arc<dyn Worker>,
    config: Arc<KilnConfig>,
    events: EventBus,
    sets: JobSets,
    queue: ReadyQueue,
    priorities: HashMap<JobId, f64>,
    stats: HistoryStats,
    running: HashMap<JobId, Running>,
    host_failures: HashMap<JobId, u32>,
    interrupt: InterruptHandle,
    dispatched: usize,
}

impl Manager {
    pub fn new(
        store: Arc<dyn Store>,
        worker: Arc<dyn Worker>,
        config: Arc<KilnConfig>,
        events: EventBus,
    ) -> Result<Self> {
        let stats = HistoryStats::from_store(store.as_ref())?;
        Ok(Self {
            store,
            worker,
            config,
            events,
            sets: JobSets::default(),
            queue: ReadyQueue::new(),
            priorities: HashMap::new(),
            stats,
            running: HashMap::new(),
            host_failures: HashMap::new(),
            interrupt: InterruptHandle::new(),
            dispatched: 0,
        })
    }

    pub fn sets(&self) -> &JobSets {
        &self.sets
    }

    /// A handle that stops this manager at its next step.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn summary(&self) -> ManagerSummary {
        ManagerSummary {
            targets: self.sets.targets.clone(),
            done: self.sets.done.clone(),
            failed: self.sets.failed.clone(),
            blocked: self.sets.blocked.clone(),
            deleted: self.sets.deleted.clone(),
        }
    }

    fn query(&self) -> CacheQueryDB {
        CacheQueryDB::new(self.store.clone(), self.config.tolerate_db_inconsistencies)
    }

    /// Ask for `jobs` (and everything they need) to be brought up to date.
    pub fn add_targets<I>(&mut self, jobs: I) -> Result<()>
    where
        I: IntoIterator<Item = JobId>,
    {
        let jobs: BTreeSet<JobId> = jobs.into_iter().collect();
        let mut cq = self.query();
        for job_id in &jobs {
            if !cq.job_exists(job_id)? {
                return Err(Error::JobNotFound(job_id.clone()));
            }
            if self.sets.processing.contains(job_id) {
                return Err(Error::bug(format!(
                    "cannot add {} as a target while it is processing",
                    job_id
                )));
            }
        }
        self.sets.targets.extend(jobs.iter().cloned());
        self.schedule(&mut cq, &jobs)
    }

    /// Classify `jobs` and their closure into the job sets.
    fn schedule(&mut self, cq: &mut CacheQueryDB, jobs: &BTreeSet<JobId>) -> Result<()> {
        for job_id in jobs {
            if !self.sets.processing.contains(job_id) {
                self.sets.remove_everywhere(job_id);
            }
        }
        let TodoTargets { todo, done, ready } = cq.list_todo_targets(jobs.iter())?;

        for job_id in done {
            if self.sets.processing.contains(&job_id) || self.sets.is_terminal(&job_id) {
                continue;
            }
            self.sets.remove_everywhere(&job_id);
            self.sets.all_targets.insert(job_id.clone());
            self.sets.done.insert(job_id);
        }

        let mut entering = Vec::new();
        for job_id in todo {
            if self.sets.processing.contains(&job_id) || self.sets.is_terminal(&job_id) {
                continue;
            }
            self.sets.remove_everywhere(&job_id);
            self.sets.all_targets.insert(job_id.clone());
            if ready.contains(&job_id) {
                self.make_ready(&job_id);
            } else {
                self.sets.todo.insert(job_id.clone());
            }
            entering.push(job_id);
        }

        for job_id in &entering {
            if !self.sets.todo.contains(job_id) {
                continue;
            }
            let children = cq.direct_children(job_id)?;
            let blocking = children
                .into_iter()
                .find(|c| self.sets.failed.contains(c) || self.sets.blocked.contains(c));
            if let Some(blocking) = blocking {
                self.block(job_id, &blocking)?;
                self.propagate_blocked(cq, job_id)?;
            }
        }

        let mut memo = HashMap::new();
        for job_id in entering {
            if !(self.sets.todo.contains(&job_id) || self.sets.ready_todo.contains(&job_id)) {
                continue;
            }
            let priority =
                compute_priority(&job_id, cq, &self.sets.all_targets, &self.stats, &mut memo)?;
            self.priorities.insert(job_id, priority);
        }

        debug!(
            todo = self.sets.todo.len(),
            ready = self.sets.ready_todo.len(),
            done = self.sets.done.len(),
            "Scheduled jobs"
        );
        Ok(())
    }

    /// Run until every target is done, failed or blocked.
    pub async fn process(&mut self) -> Result<ManagerSummary> {
        info!(
            targets = self.sets.targets.len(),
            worker = self.worker.name(),
            "Processing targets"
        );
        while self.sets.has_work() {
            if let Err(e) = self.step().await {
                self.cleanup().await;
                return Err(e);
            }
        }
        self.worker.cleanup().await;

        let summary = self.summary();
        self.events.publish(Event::ManagerSucceeded {
            nothing_to_do: self.dispatched == 0,
            sets: self.sets.snapshot(),
        });
        info!(
            done = summary.done.len(),
            failed = summary.failed.len(),
            blocked = summary.blocked.len(),
            "Processing finished"
        );
        Ok(summary)
    }

    /// One iteration of the control loop.
    pub async fn step(&mut self) -> Result<()> {
        if self.interrupt.is_interrupted() {
            self.cleanup().await;
            let reason = "interrupted by operator".to_string();
            self.events.publish(Event::ManagerInterrupted {
                reason: reason.clone(),
            });
            return Err(Error::Interrupted(reason));
        }

        if self.sets.ready_todo.is_empty() && self.sets.processing.is_empty() {
            self.repair_stuck()?;
        } else {
            self.instance_some_jobs().await?;
            self.check_timeouts()?;
            self.wait_for_completion().await;
            self.reconcile_ready().await?;
        }

        if self.config.check_invariants {
            self.sets.check_invariants()?;
        }
        self.events
            .publish(Event::ManagerProgress(self.sets.snapshot()));
        Ok(())
    }

    async fn instance_some_jobs(&mut self) -> Result<()> {
        while !self.sets.ready_todo.is_empty() {
            let mut reasons = BTreeMap::new();
            if !self.worker.can_accept_job(&mut reasons) {
                debug!(?reasons, "Worker is not accepting jobs");
                self.events.publish(Event::ManagerWait { reasons });
                break;
            }
            let Some(job_id) = self.queue.pick(&self.sets.ready_todo, &self.priorities) else {
                break;
            };
            self.start_job(job_id).await?;
        }
        Ok(())
    }

    async fn start_job(&mut self, job_id: JobId) -> Result<()> {
        self.sets.ready_todo.remove(&job_id);
        self.queue.forget(&job_id);
        debug!(job_id = %job_id, "Dispatching job");
        let handle = self.worker.instance_job(&job_id).await?;
        self.sets.processing.insert(job_id.clone());
        self.running.insert(
            job_id.clone(),
            Running {
                handle,
                started: Instant::now(),
            },
        );
        self.dispatched += 1;
        self.events
            .publish(Event::ManagerJobProcessing { job_id });
        Ok(())
    }

    fn check_timeouts(&mut self) -> Result<()> {
        let Some(limit) = self.config.job_timeout else {
            return Ok(());
        };
        let mut expired: Vec<JobId> = self
            .running
            .iter()
            .filter(|(_, running)| running.started.elapsed() > limit)
            .map(|(job_id, _)| job_id.clone())
            .collect();
        expired.sort();

        for job_id in expired {
            if let Some(mut running) = self.running.remove(&job_id) {
                running.handle.cancel();
            }
            self.roll_back_definitions(&job_id)?;
            let reason = format!("timed out after {:?}", limit);
            warn!(job_id = %job_id, reason = %reason, "Job timed out");
            mark_as_failed(
                self.store.as_ref(),
                &job_id,
                &reason,
                None,
                FailureKind::Timeout,
            )?;
            self.job_failed(&job_id, reason)?;
        }
        Ok(())
    }

    async fn wait_for_completion(&mut self) {
        if self.running.values_mut().any(|running| running.handle.ready()) {
            return;
        }
        let poll_interval = self.config.poll_interval;
        let signal = self.worker.completion_signal();
        let interrupt = self.interrupt.clone();
        let completed = async {
            match &signal {
                Some(signal) => signal.notified().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = completed => {}
            _ = interrupt.notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    async fn reconcile_ready(&mut self) -> Result<()> {
        let mut ready: Vec<JobId> = self
            .running
            .iter_mut()
            .filter_map(|(job_id, running)| running.handle.ready().then(|| job_id.clone()))
            .collect();
        ready.sort();

        for job_id in ready {
            let Some(mut running) = self.running.remove(&job_id) else {
                continue;
            };
            let completion = running.handle.get(Duration::ZERO).await;
            // Releases the worker slot.
            drop(running);
            self.sets.processing.remove(&job_id);
            self.handle_completion(&job_id, completion)?;
        }
        Ok(())
    }

    fn handle_completion(&mut self, job_id: &JobId, completion: JobCompletion) -> Result<()> {
        match completion {
            Ok(outcome) => self.job_succeeded(job_id, outcome),
            Err(JobFailure::Failed {
                reason,
                deleted_jobs,
                ..
            }) => {
                self.mark_deleted(&deleted_jobs);
                self.job_failed(job_id, reason)
            }
            Err(JobFailure::HostFailed { host, reason, .. }) => {
                self.host_failed(job_id, &host, reason)
            }
            Err(JobFailure::Interrupted { deleted_jobs, .. }) => {
                // The job saw the interrupt first; stop at the next step.
                self.mark_deleted(&deleted_jobs);
                self.make_ready(job_id);
                self.interrupt.interrupt();
                Ok(())
            }
            Err(JobFailure::Bug { message, .. }) => Err(Error::bug(message)),
            Err(JobFailure::NotReady(_)) => Err(Error::bug(format!(
                "handle for {} reported ready but had no result",
                job_id
            ))),
        }
    }

    fn job_succeeded(&mut self, job_id: &JobId, outcome: MakeOutcome) -> Result<()> {
        self.mark_deleted(&outcome.deleted_jobs);
        self.sets.remove_everywhere(job_id);
        self.sets.done.insert(job_id.clone());
        self.host_failures.remove(job_id);
        self.events.publish(Event::ManagerJobDone {
            job_id: job_id.clone(),
        });

        let mut cq = self.query();

        if self.config.recurse {
            let new_jobs: BTreeSet<JobId> = outcome
                .new_jobs
                .iter()
                .filter(|j| !self.sets.all_targets.contains(*j))
                .cloned()
                .collect();
            if !new_jobs.is_empty() {
                debug!(job_id = %job_id, count = new_jobs.len(), "Adding defined jobs as targets");
                self.sets.targets.extend(new_jobs.iter().cloned());
                self.schedule(&mut cq, &new_jobs)?;
            }
        }

        let parents = cq.direct_parents(job_id)?;
        if !outcome.user_object_deps.is_empty() {
            self.add_result_dependencies(&mut cq, job_id, &parents, &outcome.user_object_deps)?;
        }

        for parent in &parents {
            if self.sets.todo.contains(parent) && self.children_done(&mut cq, parent)? {
                self.make_ready(parent);
            }
        }
        Ok(())
    }

    /// The result of `job_id` references `deps`, so every job that consumes
    /// it now needs them too. Parents already scheduled are re-opened.
    fn add_result_dependencies(
        &mut self,
        cq: &mut CacheQueryDB,
        job_id: &JobId,
        parents: &BTreeSet<JobId>,
        deps: &BTreeSet<JobId>,
    ) -> Result<()> {
        let store = self.store.as_ref();
        for parent in parents {
            db::db_job_add_dynamic_children(store, parent, job_id, deps)?;
            for dep in deps {
                db::db_job_add_parent(store, dep, parent)?;
            }
        }
        cq.invalidate();

        let mut reopen = BTreeSet::new();
        for parent in parents {
            if !self.sets.all_targets.contains(parent) || self.sets.processing.contains(parent) {
                continue;
            }
            if self.sets.done.contains(parent) {
                warn!(
                    job_id = %parent,
                    dependency = %job_id,
                    "Re-opening a job that was already done"
                );
            }
            reopen.insert(parent.clone());
        }
        if !reopen.is_empty() {
            debug!(
                job_id = %job_id,
                parents = reopen.len(),
                deps = deps.len(),
                "Re-opening parents"
            );
            self.schedule(cq, &reopen)?;
        }
        Ok(())
    }

    /// Whether every child of `job_id` is done, consulting the store for
    /// children this manager does not track.
    fn children_done(&self, cq: &mut CacheQueryDB, job_id: &JobId) -> Result<bool> {
        for child in cq.direct_children(job_id)? {
            let done = if self.sets.all_targets.contains(&child) {
                self.sets.done.contains(&child)
            } else {
                cq.up_to_date(&child)?.up_to_date
            };
            if !done {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn make_ready(&mut self, job_id: &JobId) {
        self.sets.remove_everywhere(job_id);
        self.sets.ready_todo.insert(job_id.clone());
        self.queue.enter(job_id);
        self.events.publish(Event::ManagerJobReady {
            job_id: job_id.clone(),
        });
    }

    fn mark_deleted(&mut self, deleted: &BTreeSet<JobId>) {
        for job_id in deleted {
            if let Some(mut running) = self.running.remove(job_id) {
                debug!(job_id = %job_id, "Cancelling deleted job");
                running.handle.cancel();
            }
            self.queue.forget(job_id);
            self.priorities.remove(job_id);
            if self.sets.all_targets.contains(job_id) {
                self.sets.remove_everywhere(job_id);
                self.sets.deleted.insert(job_id.clone());
            }
        }
    }

    fn job_failed(&mut self, job_id: &JobId, reason: String) -> Result<()> {
        self.sets.remove_everywhere(job_id);
        self.sets.failed.insert(job_id.clone());
        self.queue.forget(job_id);
        error!(job_id = %job_id, reason = %reason, "Job failed");
        self.events.publish(Event::ManagerJobFailed {
            job_id: job_id.clone(),
            reason,
        });
        let mut cq = self.query();
        self.propagate_blocked(&mut cq, job_id)
    }

    fn host_failed(&mut self, job_id: &JobId, host: &str, reason: String) -> Result<()> {
        let count = self.host_failures.entry(job_id.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        self.events.publish(Event::ManagerHostFailed {
            job_id: job_id.clone(),
            reason: reason.clone(),
        });

        if count <= self.config.max_host_failures {
            warn!(
                job_id = %job_id,
                host = %host,
                attempt = count,
                reason = %reason,
                "Host failed, retrying job"
            );
            self.make_ready(job_id);
            return Ok(());
        }
        let reason = format!("host failed {} times, last on {}: {}", count, host, reason);
        mark_as_failed(
            self.store.as_ref(),
            job_id,
            &reason,
            None,
            FailureKind::Error,
        )?;
        self.job_failed(job_id, reason)
    }

    fn block(&mut self, job_id: &JobId, blocking: &JobId) -> Result<()> {
        self.sets.remove_everywhere(job_id);
        self.sets.blocked.insert(job_id.clone());
        self.queue.forget(job_id);
        mark_as_blocked(self.store.as_ref(), job_id, blocking)?;
        debug!(job_id = %job_id, blocking = %blocking, "Job blocked");
        self.events.publish(Event::ManagerJobBlocked {
            job_id: job_id.clone(),
            blocking_job_id: blocking.clone(),
        });
        Ok(())
    }

    /// Block every waiting job that depends on `from`, directly or through
    /// other blocked jobs, or that `from` defined.
    fn propagate_blocked(&mut self, cq: &mut CacheQueryDB, from: &JobId) -> Result<()> {
        let mut pending = VecDeque::from([from.clone()]);
        while let Some(current) = pending.pop_front() {
            let mut dependents = cq.direct_parents(&current)?;
            let waiting: Vec<JobId> = self
                .sets
                .todo
                .iter()
                .chain(self.sets.ready_todo.iter())
                .cloned()
                .collect();
            for job_id in waiting {
                if cq.get_job(&job_id)?.defined_by.contains(&current) {
                    dependents.insert(job_id);
                }
            }

            for dependent in dependents {
                let waiting = self.sets.todo.contains(&dependent)
                    || self.sets.ready_todo.contains(&dependent);
                if !waiting {
                    continue;
                }
                self.block(&dependent, &current)?;
                pending.push_back(dependent);
            }
        }
        Ok(())
    }

    /// Nothing is ready or running but jobs remain: re-derive their state
    /// from the store. Fails if that changes nothing.
    fn repair_stuck(&mut self) -> Result<()> {
        let before = self.sets.snapshot();
        let mut cq = self.query();
        let stuck: Vec<JobId> = self.sets.todo.iter().cloned().collect();
        warn!(jobs = stuck.len(), "No job is ready or running, re-checking todo jobs");

        let mut missing = BTreeSet::new();
        for job_id in &stuck {
            if !self.sets.todo.contains(job_id) {
                continue;
            }
            if cq.up_to_date(job_id)?.up_to_date {
                self.sets.remove_everywhere(job_id);
                self.sets.done.insert(job_id.clone());
                continue;
            }
            let mut ready = true;
            let mut blocking = None;
            for child in cq.direct_children(job_id)? {
                if self.sets.done.contains(&child) {
                    continue;
                }
                if self.sets.failed.contains(&child) || self.sets.blocked.contains(&child) {
                    blocking = Some(child);
                    break;
                }
                if !self.sets.all_targets.contains(&child) && cq.job_exists(&child)? {
                    if cq.up_to_date(&child)?.up_to_date {
                        continue;
                    }
                    missing.insert(child);
                }
                ready = false;
            }
            if let Some(blocking) = blocking {
                self.block(job_id, &blocking)?;
                self.propagate_blocked(&mut cq, job_id)?;
            } else if ready {
                self.make_ready(job_id);
            }
        }
        if !missing.is_empty() {
            self.schedule(&mut cq, &missing)?;
        }

        if self.sets.snapshot() == before {
            let problems = check_consistency(self.store.as_ref())?;
            for problem in &problems {
                error!(problem = %problem, "Store inconsistency");
            }
            return Err(Error::bug(format!(
                "manager is stuck: {} jobs todo, none ready or processing ({} store inconsistencies)",
                stuck.len(),
                problems.len()
            )));
        }
        Ok(())
    }

    /// A cancelled attempt never reports what it declared: delete whatever
    /// the job defined so far.
    fn roll_back_definitions(&mut self, job_id: &JobId) -> Result<()> {
        let mut cq = self.query();
        let deleted = delete_jobs_defined_by(&mut cq, job_id)?;
        self.mark_deleted(&deleted);
        Ok(())
    }

    /// Cancel in-flight jobs, roll them back to not started and release the
    /// worker.
    async fn cleanup(&mut self) {
        let mut running: Vec<JobId> = self.running.keys().cloned().collect();
        running.sort();
        for job_id in running {
            if let Some(mut running) = self.running.remove(&job_id) {
                debug!(job_id = %job_id, "Cancelling job");
                running.handle.cancel();
            }
            let rolled_back = self
                .roll_back_definitions(&job_id)
                .and_then(|()| db::delete_job_cache(self.store.as_ref(), &job_id));
            if let Err(e) = rolled_back {
                error!(job_id = %job_id, error = %e, "Failed to roll back cancelled job");
            }
            self.make_ready(&job_id);
        }
        self.worker.cleanup().await;
    }
}

/// Bring `targets` up to date with a fresh manager.
pub async fn make_targets(
    store: Arc<dyn Store>,
    worker: Arc<dyn Worker>,
    config: Arc<KilnConfig>,
    events: EventBus,
    targets: impl IntoIterator<Item = JobId>,
) -> Result<ManagerSummary> {
    let mut manager = Manager::new(store, worker, config, events)?;
    manager.add_targets(targets)?;
    manager.process().await
}
