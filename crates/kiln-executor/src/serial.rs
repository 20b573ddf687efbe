//! In-process worker that runs one job at a time.

use async_trait::async_trait;
use kiln_core::{JobCompletion, JobFailure, JobId, ResultHandle, Result, Worker};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::{Context, make};

/// Runs each job to completion inside `instance_job`.
///
/// A new job is accepted only once the handle of the previous one has been
/// dropped.
pub struct SerialWorker {
    context: Context,
    outstanding: Arc<AtomicUsize>,
}

impl SerialWorker {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct Slot(Arc<AtomicUsize>);

impl Slot {
    fn take(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Slot(counter.clone())
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle of a job that already finished.
struct CompletedHandle {
    job_id: JobId,
    completion: Option<JobCompletion>,
    _slot: Slot,
}

#[async_trait]
impl ResultHandle for CompletedHandle {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn ready(&mut self) -> bool {
        true
    }

    async fn get(&mut self, _timeout: Duration) -> JobCompletion {
        self.completion.take().unwrap_or_else(|| {
            Err(JobFailure::Bug {
                job_id: self.job_id.clone(),
                message: "result already collected".to_string(),
            })
        })
    }

    fn cancel(&mut self) {}
}

#[async_trait]
impl Worker for SerialWorker {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn can_accept_job(&self, reasons: &mut BTreeMap<String, String>) -> bool {
        let outstanding = self.outstanding.load(Ordering::SeqCst);
        if outstanding == 0 {
            true
        } else {
            reasons.insert(
                "serial".to_string(),
                format!("{} job result not yet collected", outstanding),
            );
            false
        }
    }

    async fn instance_job(&self, job_id: &JobId) -> Result<Box<dyn ResultHandle>> {
        let slot = Slot::take(&self.outstanding);
        let session = self.context.fork();
        let completion = make(job_id, &session).await;
        Ok(Box::new(CompletedHandle {
            job_id: job_id.clone(),
            completion: Some(completion),
            _slot: slot,
        }))
    }
}
