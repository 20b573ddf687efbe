//! Persisted per-job records: definition, cache (status) and arguments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::promise::collect_promises;
use crate::{Error, JobId, Result};

/// The persisted definition of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub job_id: JobId,
    /// Jobs whose results this job's arguments depend on.
    pub children: BTreeSet<JobId>,
    /// Jobs that depend on this one (inverse index).
    pub parents: BTreeSet<JobId>,
    /// Human label, usually the command name.
    pub command_desc: String,
    /// Whether this is a dynamic job allowed to define further jobs.
    pub needs_context: bool,
    /// Stack of dynamic jobs executing when this job was declared, starting at `root`.
    pub defined_by: Vec<JobId>,
    /// Dependencies added retroactively, keyed by the child whose result referenced them.
    pub dynamic_children: BTreeMap<JobId, BTreeSet<JobId>>,
}

impl Job {
    pub fn new(job_id: JobId, command_desc: impl Into<String>, defined_by: Vec<JobId>) -> Self {
        Self {
            job_id,
            children: BTreeSet::new(),
            parents: BTreeSet::new(),
            command_desc: command_desc.into(),
            needs_context: false,
            defined_by,
            dynamic_children: BTreeMap::new(),
        }
    }

    /// The dynamic jobs that (transitively) defined this one, excluding `root`.
    pub fn definers(&self) -> impl Iterator<Item = &JobId> {
        self.defined_by.iter().filter(|id| !id.is_root())
    }

    /// Nesting depth inside dynamic jobs; zero for jobs defined at top level.
    pub fn definition_depth(&self) -> usize {
        self.definers().count()
    }

    /// Record dependencies discovered in the result of `returned_by`.
    pub fn add_dynamic_children(&mut self, returned_by: &JobId, children: &BTreeSet<JobId>) {
        self.dynamic_children
            .entry(returned_by.clone())
            .or_default()
            .extend(children.iter().cloned());
        self.children.extend(children.iter().cloned());
    }

    /// Check the record-level invariants of a definition.
    pub fn check_invariants(&self) -> Result<()> {
        match self.defined_by.first() {
            Some(first) if first.is_root() => {}
            _ => {
                return Err(Error::bug(format!(
                    "job {} has defined_by {:?} which does not start at root",
                    self.job_id, self.defined_by
                )));
            }
        }
        for (returned_by, dynamic) in &self.dynamic_children {
            if let Some(missing) = dynamic.iter().find(|c| !self.children.contains(*c)) {
                return Err(Error::bug(format!(
                    "job {}: dynamic child {} (returned by {}) is not among its children",
                    self.job_id, missing, returned_by
                )));
            }
        }
        Ok(())
    }
}

/// Execution state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheState {
    #[default]
    NotStarted,
    Processing,
    Done,
    Failed,
    Blocked,
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CacheState::NotStarted => "not started",
            CacheState::Processing => "processing",
            CacheState::Done => "done",
            CacheState::Failed => "failed",
            CacheState::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Completion timestamp of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobTimestamp {
    #[default]
    Never,
    /// Sentinel: the job must be recomputed regardless of its state.
    ForceRemake,
    At(DateTime<Utc>),
}

impl JobTimestamp {
    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobTimestamp::At(ts) => Some(*ts),
            _ => None,
        }
    }
}

/// Why a job ended up FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Error,
    Timeout,
    OutOfMemory,
}

/// The status record of a job. A missing record means `NotStarted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Cache {
    pub state: CacheState,
    /// Completion time, or the force-remake sentinel.
    pub timestamp: JobTimestamp,
    pub timestamp_started: Option<DateTime<Utc>>,
    /// Seconds spent computing.
    pub cputime_used: Option<f64>,
    /// Wall-clock seconds from start to completion.
    pub walltime_used: Option<f64>,
    pub host: Option<String>,
    /// Jobs created by this (dynamic) job. Meaningful only when DONE.
    #[serde(default)]
    pub jobs_defined: BTreeSet<JobId>,
    pub exception: Option<String>,
    pub backtrace: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub captured_stdout: Option<String>,
    pub captured_stderr: Option<String>,
}

impl Cache {
    pub fn new(state: CacheState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == CacheState::Done
    }

    pub fn is_failed(&self) -> bool {
        self.state == CacheState::Failed
    }

    /// Failed because it ran too long or out of memory.
    pub fn failed_for_resources(&self) -> bool {
        self.is_failed()
            && matches!(
                self.failure_kind,
                Some(FailureKind::Timeout) | Some(FailureKind::OutOfMemory)
            )
    }
}

/// The command and raw arguments of a job, with promises unresolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobArgs {
    /// Registered command name.
    pub command: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    /// Dependencies declared explicitly rather than through a promise.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub extra_deps: BTreeSet<JobId>,
}

impl JobArgs {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            extra_deps: BTreeSet::new(),
        }
    }

    /// All argument values, positional first.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.args.iter().chain(self.kwargs.values())
    }

    /// Jobs this one depends on by declaration: promises in the arguments
    /// plus the explicit extra dependencies.
    pub fn declared_dependencies(&self) -> BTreeSet<JobId> {
        let mut deps: BTreeSet<JobId> = self.values().flat_map(collect_promises).collect();
        deps.extend(self.extra_deps.iter().cloned());
        deps
    }
}
