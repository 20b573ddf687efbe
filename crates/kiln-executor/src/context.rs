//! Job definition sessions.
//!
//! A [`Context`] is the handle user code uses to declare jobs. The top-level
//! session declares jobs as defined by `root`; every dynamic job runs with a
//! child session whose `defined_by` stack ends with that job, so the jobs it
//! declares can be traced back to (and deleted with) their definer.

use kiln_config::KilnConfig;
use kiln_core::{Error, Event, EventBus, Job, JobArgs, JobId, Promise, Result, Store};
use kiln_db as db;
use kiln_db_queries::{CacheQueryDB, clean_targets};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::CommandRegistry;

/// A job definition session.
pub struct Context {
    store: Arc<dyn Store>,
    registry: Arc<CommandRegistry>,
    config: Arc<KilnConfig>,
    events: EventBus,
    /// `defined_by` of every job declared in this session.
    currently_executing: Vec<JobId>,
    prefix: Option<String>,
    jobs_defined: BTreeSet<JobId>,
    id_counters: HashMap<String, u32>,
}

impl Context {
    /// Open a top-level session.
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<CommandRegistry>,
        config: Arc<KilnConfig>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            events,
            currently_executing: vec![JobId::root()],
            prefix: None,
            jobs_defined: BTreeSet::new(),
            id_counters: HashMap::new(),
        }
    }

    /// A fresh top-level session sharing this one's store, commands and bus.
    pub fn fork(&self) -> Self {
        Self::new(
            self.store.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.events.clone(),
        )
    }

    /// The session a dynamic job runs in.
    pub fn child_session(&self, job: &Job) -> Self {
        let mut child = self.fork();
        child.currently_executing = job.defined_by.clone();
        child.currently_executing.push(job.job_id.clone());
        child
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<KilnConfig> {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The stack recorded as `defined_by` for jobs declared here.
    pub fn currently_executing(&self) -> &[JobId] {
        &self.currently_executing
    }

    /// Jobs declared in this session so far.
    pub fn jobs_defined(&self) -> &BTreeSet<JobId> {
        &self.jobs_defined
    }

    pub fn into_jobs_defined(self) -> BTreeSet<JobId> {
        self.jobs_defined
    }

    /// Prefix prepended (as `<prefix>-`) to the ids of jobs declared from now on.
    pub fn comp_prefix(&mut self, prefix: Option<&str>) {
        self.prefix = prefix.map(str::to_string);
    }

    pub fn query(&self) -> CacheQueryDB {
        CacheQueryDB::new(self.store.clone(), self.config.tolerate_db_inconsistencies)
    }

    /// Start declaring a job running `command`.
    pub fn comp(&mut self, command: impl Into<String>) -> JobBuilder<'_> {
        JobBuilder::new(self, command.into())
    }

    /// Start declaring a dynamic job, which may itself declare jobs.
    pub fn comp_dynamic(&mut self, command: impl Into<String>) -> JobBuilder<'_> {
        self.comp(command).needs_context(true)
    }

    fn prefixed(&self, id: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}-{}", prefix, id),
            None => id.to_string(),
        }
    }

    /// Whether `candidate` may be (re)used for a job declared with `defined_by`.
    fn id_available(&self, candidate: &JobId, defined_by: &[JobId]) -> Result<bool> {
        if self.jobs_defined.contains(candidate) {
            return Ok(false);
        }
        if !db::job_exists(self.store.as_ref(), candidate)? {
            return Ok(true);
        }
        let existing = db::get_job(self.store.as_ref(), candidate)?;
        Ok(existing.defined_by == defined_by)
    }

    fn explicit_job_id(&self, id: &str, defined_by: &[JobId]) -> Result<JobId> {
        JobId::validate(id)?;
        let base = JobId::new(self.prefixed(id));
        if self.jobs_defined.contains(&base) {
            return Err(Error::user(format!(
                "job {} was already defined in this session",
                base
            )));
        }
        if self.id_available(&base, defined_by)? {
            return Ok(base);
        }
        for n in 1..=self.config.max_job_id_suffix {
            let candidate = JobId::new(format!("{}-{}", base, n));
            if self.id_available(&candidate, defined_by)? {
                debug!(requested = %base, job_id = %candidate, "Job id taken by another definer");
                return Ok(candidate);
            }
        }
        Err(Error::bug(format!(
            "no free job id for {} after {} attempts",
            base, self.config.max_job_id_suffix
        )))
    }

    fn generate_job_id(&mut self, command: &str, defined_by: &[JobId]) -> Result<JobId> {
        let base = self.prefixed(command);
        let start = self.id_counters.get(&base).copied().unwrap_or(1);
        for n in start..=self.config.max_job_id_suffix {
            let candidate = if n == 1 {
                JobId::new(base.clone())
            } else {
                JobId::new(format!("{}-{}", base, n))
            };
            if self.id_available(&candidate, defined_by)? {
                self.id_counters.insert(base, n + 1);
                return Ok(candidate);
            }
        }
        Err(Error::bug(format!(
            "no free job id for {} after {} attempts",
            base, self.config.max_job_id_suffix
        )))
    }

    fn define(&mut self, spec: JobBuilderSpec) -> Result<Promise> {
        let JobBuilderSpec {
            command,
            command_desc,
            args,
            kwargs,
            job_id,
            extra_deps,
            needs_context,
        } = spec;

        if !self.registry.contains(&command) {
            return Err(Error::user(format!("command {} is not registered", command)));
        }

        let defined_by = self.currently_executing.clone();
        let job_id = match job_id {
            Some(id) => self.explicit_job_id(&id, &defined_by)?,
            None => self.generate_job_id(&command, &defined_by)?,
        };
        JobId::validate(job_id.as_str())?;

        let job_args = JobArgs {
            command: command.clone(),
            args,
            kwargs,
            extra_deps,
        };
        let children = job_args.declared_dependencies();

        let store = self.store.clone();
        for child in &children {
            if *child == job_id {
                return Err(Error::user(format!("job {} cannot depend on itself", job_id)));
            }
            if !db::job_exists(store.as_ref(), child)? {
                return Err(Error::user(format!(
                    "job {} depends on {} which is not defined",
                    job_id, child
                )));
            }
        }

        let existed = db::job_exists(store.as_ref(), &job_id)?;
        if existed && self.config.check_params {
            self.check_params(&job_id, &job_args)?;
        }

        let mut job = Job::new(
            job_id.clone(),
            command_desc.unwrap_or(command),
            defined_by,
        );
        job.children = children;
        job.needs_context = needs_context;

        if existed {
            let old = db::get_job(store.as_ref(), &job_id)?;
            if old.defined_by != job.defined_by {
                warn!(
                    job_id = %job_id,
                    old = ?old.defined_by,
                    new = ?job.defined_by,
                    "Job is now defined by a different job"
                );
            }
            job.parents.extend(old.parents);
            for (returned_by, dynamic) in &old.dynamic_children {
                job.add_dynamic_children(returned_by, dynamic);
            }
        }

        for child in &job.children {
            db::db_job_add_parent(store.as_ref(), child, &job_id)?;
        }
        db::set_job_args(store.as_ref(), &job_id, &job_args)?;
        db::set_job(store.as_ref(), &job)?;

        self.jobs_defined.insert(job_id.clone());
        debug!(job_id = %job_id, children = job.children.len(), "Defined job");
        self.events.publish(Event::JobDefined {
            job_id: job_id.clone(),
        });
        Ok(Promise::new(job_id))
    }

    /// Invalidate a redefined job whose arguments changed.
    fn check_params(&self, job_id: &JobId, new_args: &JobArgs) -> Result<()> {
        let store = self.store.as_ref();
        if !db::job_args_exists(store, job_id)? {
            return Ok(());
        }
        let old_args = db::get_job_args(store, job_id)?;
        if same_computation(&old_args, new_args) {
            return Ok(());
        }
        let reason = if old_args.command != new_args.command {
            format!(
                "command changed from {} to {}",
                old_args.command, new_args.command
            )
        } else {
            "arguments changed".to_string()
        };
        info!(job_id = %job_id, reason = %reason, "Job redefined, cleaning");
        let mut cq = self.query();
        clean_targets(&mut cq, &BTreeSet::from([job_id.clone()]))?;
        self.events.publish(Event::JobRedefined {
            job_id: job_id.clone(),
            reason,
        });
        Ok(())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("store", &self.store.name())
            .field("currently_executing", &self.currently_executing)
            .field("prefix", &self.prefix)
            .field("jobs_defined", &self.jobs_defined)
            .finish_non_exhaustive()
    }
}

/// Whether two argument records describe the same computation.
pub fn same_computation(a: &JobArgs, b: &JobArgs) -> bool {
    a.command == b.command
        && a.args == b.args
        && a.kwargs == b.kwargs
        && a.extra_deps == b.extra_deps
}

struct JobBuilderSpec {
    command: String,
    command_desc: Option<String>,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    job_id: Option<String>,
    extra_deps: BTreeSet<JobId>,
    needs_context: bool,
}

/// Builder returned by [`Context::comp`].
#[must_use = "a job is only declared when `define` is called"]
pub struct JobBuilder<'c> {
    context: &'c mut Context,
    spec: JobBuilderSpec,
}

impl<'c> JobBuilder<'c> {
    fn new(context: &'c mut Context, command: String) -> Self {
        Self {
            context,
            spec: JobBuilderSpec {
                command,
                command_desc: None,
                args: Vec::new(),
                kwargs: BTreeMap::new(),
                job_id: None,
                extra_deps: BTreeSet::new(),
                needs_context: false,
            },
        }
    }

    /// Append a positional argument. Promises inside it become dependencies.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.spec.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.spec.kwargs.insert(name.into(), value.into());
        self
    }

    /// Use an explicit job id instead of one derived from the command name.
    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.spec.job_id = Some(id.into());
        self
    }

    /// Depend on a job whose result is not passed as an argument.
    pub fn extra_dep(mut self, promise: &Promise) -> Self {
        self.spec.extra_deps.insert(promise.job_id().clone());
        self
    }

    pub fn needs_context(mut self, needs_context: bool) -> Self {
        self.spec.needs_context = needs_context;
        self
    }

    /// Human label shown in listings; defaults to the command name.
    pub fn command_name(mut self, desc: impl Into<String>) -> Self {
        self.spec.command_desc = Some(desc.into());
        self
    }

    /// Persist the job and return a promise of its result.
    pub fn define(self) -> Result<Promise> {
        self.context.define(self.spec)
    }
}
