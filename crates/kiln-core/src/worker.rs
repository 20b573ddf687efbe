//! Worker trait and job outcome types.
//!
//! Workers run jobs on behalf of the manager (inline, in a task pool, or on
//! another machine) and hand back a [`ResultHandle`] the manager polls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

use crate::{JobId, Result};

/// What a successful job run reports back to the manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MakeOutcome {
    /// Jobs defined while the job ran.
    pub new_jobs: BTreeSet<JobId>,
    /// Jobs deleted because the job no longer defines them.
    pub deleted_jobs: BTreeSet<JobId>,
    /// Jobs referenced by promises inside the produced result.
    pub user_object_deps: BTreeSet<JobId>,
}

/// Why a job run did not produce a result.
#[derive(Debug, Clone, Error)]
pub enum JobFailure {
    /// The user computation failed.
    #[error("job {job_id} failed: {reason}")]
    Failed {
        job_id: JobId,
        reason: String,
        backtrace: Option<String>,
        deleted_jobs: BTreeSet<JobId>,
    },

    /// The infrastructure running the job failed; the job can be retried.
    #[error("host {host} failed while running {job_id}: {reason}")]
    HostFailed {
        job_id: JobId,
        host: String,
        reason: String,
    },

    #[error("job {job_id} was interrupted")]
    Interrupted {
        job_id: JobId,
        deleted_jobs: BTreeSet<JobId>,
    },

    #[error("internal error while running {job_id}: {message}")]
    Bug { job_id: JobId, message: String },

    /// The handle had no result within the requested timeout.
    #[error("result not ready after {0:?}")]
    NotReady(Duration),
}

pub type JobCompletion = std::result::Result<MakeOutcome, JobFailure>;

/// Handle to an in-flight job.
#[async_trait]
pub trait ResultHandle: Send {
    fn job_id(&self) -> &JobId;

    /// Whether `get` would return without waiting.
    fn ready(&mut self) -> bool;

    /// Wait up to `timeout` for the outcome. Returns `JobFailure::NotReady` on timeout.
    async fn get(&mut self, timeout: Duration) -> JobCompletion;

    /// Ask the worker to stop the job. Best effort.
    fn cancel(&mut self);
}

/// Pluggable job-instantiation strategy.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Name of this worker strategy.
    fn name(&self) -> &'static str;

    /// Admission control. Fills `reasons` with human-readable causes when refusing.
    fn can_accept_job(&self, reasons: &mut BTreeMap<String, String>) -> bool;

    /// Start running a job.
    async fn instance_job(&self, job_id: &JobId) -> Result<Box<dyn ResultHandle>>;

    /// Notified whenever a job started by this worker finishes.
    fn completion_signal(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Release resources held by the worker.
    async fn cleanup(&self) {}
}
