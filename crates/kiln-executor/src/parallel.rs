//! Worker that runs jobs concurrently as tokio tasks.

use async_trait::async_trait;
use kiln_core::{JobCompletion, JobFailure, JobId, ResultHandle, Result, Worker};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::{Context, hostname, make};

/// Runs up to `max_jobs` jobs at once, each in its own task.
pub struct ParallelWorker {
    context: Context,
    max_jobs: usize,
    running: Arc<AtomicUsize>,
    finished: Arc<Notify>,
}

impl ParallelWorker {
    pub fn new(context: Context, max_jobs: usize) -> Self {
        Self {
            context,
            max_jobs: max_jobs.max(1),
            running: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(Notify::new()),
        }
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

/// Decrements the running count when the task ends, even when aborted.
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TaskHandle {
    job_id: JobId,
    receiver: oneshot::Receiver<JobCompletion>,
    completion: Option<JobCompletion>,
    abort: AbortHandle,
}

impl TaskHandle {
    fn lost(&self) -> JobCompletion {
        Err(JobFailure::HostFailed {
            job_id: self.job_id.clone(),
            host: hostname(),
            reason: "job task ended without reporting a result".to_string(),
        })
    }
}

#[async_trait]
impl ResultHandle for TaskHandle {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn ready(&mut self) -> bool {
        if self.completion.is_some() {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(completion) => {
                self.completion = Some(completion);
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.completion = Some(self.lost());
                true
            }
        }
    }

    async fn get(&mut self, timeout: Duration) -> JobCompletion {
        if let Some(completion) = self.completion.take() {
            return completion;
        }
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => self.lost(),
            Err(_) => Err(JobFailure::NotReady(timeout)),
        }
    }

    fn cancel(&mut self) {
        debug!(job_id = %self.job_id, "Aborting job task");
        self.abort.abort();
    }
}

#[async_trait]
impl Worker for ParallelWorker {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn can_accept_job(&self, reasons: &mut BTreeMap<String, String>) -> bool {
        let running = self.running();
        if running < self.max_jobs {
            true
        } else {
            reasons.insert(
                "parallel".to_string(),
                format!("all {} slots busy", self.max_jobs),
            );
            false
        }
    }

    async fn instance_job(&self, job_id: &JobId) -> Result<Box<dyn ResultHandle>> {
        let (sender, receiver) = oneshot::channel();
        let session = self.context.fork();
        let finished = self.finished.clone();
        let task_job_id = job_id.clone();

        self.running.fetch_add(1, Ordering::SeqCst);
        let guard = RunningGuard(self.running.clone());
        let task = tokio::spawn(async move {
            let _guard = guard;
            let completion = make(&task_job_id, &session).await;
            if sender.send(completion).is_err() {
                warn!(job_id = %task_job_id, "Job result dropped, handle is gone");
            }
            finished.notify_one();
        });

        Ok(Box::new(TaskHandle {
            job_id: job_id.clone(),
            receiver,
            completion: None,
            abort: task.abort_handle(),
        }))
    }

    fn completion_signal(&self) -> Option<Arc<Notify>> {
        Some(self.finished.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{test_context_with, test_registry};
    use crate::Invocation;
    use kiln_config::KilnConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_runs_jobs_and_signals_completion() {
        let mut ctx = test_context_with(test_registry(), KilnConfig::default());
        let a = ctx.comp("value").arg(1).define().unwrap();
        let b = ctx.comp("value").arg(2).define().unwrap();
        let worker = ParallelWorker::new(ctx.fork(), 2);
        let signal = worker.completion_signal().unwrap();

        let mut ha = worker.instance_job(a.job_id()).await.unwrap();
        let mut hb = worker.instance_job(b.job_id()).await.unwrap();

        signal.notified().await;
        assert!(ha.get(Duration::from_secs(5)).await.is_ok());
        assert!(hb.get(Duration::from_secs(5)).await.is_ok());
        assert_eq!(
            kiln_db::get_job_userobject(ctx.store().as_ref(), b.job_id()).unwrap(),
            json!(2)
        );
    }

    #[tokio::test]
    async fn test_slots_are_limited() {
        let mut registry = test_registry();
        registry.register("sleepy", Sleep(Duration::from_millis(200)));
        let mut ctx = test_context_with(registry, KilnConfig::default());
        let a = ctx.comp("sleepy").define().unwrap();
        let worker = ParallelWorker::new(ctx.fork(), 1);

        let mut handle = worker.instance_job(a.job_id()).await.unwrap();
        let mut reasons = BTreeMap::new();
        assert!(!worker.can_accept_job(&mut reasons));
        assert_eq!(reasons["parallel"], "all 1 slots busy");

        assert!(matches!(
            handle.get(Duration::from_millis(1)).await,
            Err(JobFailure::NotReady(_))
        ));
        assert!(handle.get(Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_reports_lost_job() {
        let mut registry = test_registry();
        registry.register("forever", Sleep(Duration::from_secs(3600)));
        let mut ctx = test_context_with(registry, KilnConfig::default());
        let a = ctx.comp("forever").define().unwrap();
        let worker = ParallelWorker::new(ctx.fork(), 1);

        let mut handle = worker.instance_job(a.job_id()).await.unwrap();
        handle.cancel();
        match handle.get(Duration::from_secs(5)).await {
            Err(JobFailure::HostFailed { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
        tokio::task::yield_now().await;
        assert_eq!(worker.running(), 0);
    }

    struct Sleep(Duration);

    #[async_trait]
    impl crate::Command for Sleep {
        async fn run(
            &self,
            _context: Option<&mut Context>,
            _invocation: Invocation,
        ) -> crate::CommandResult {
            tokio::time::sleep(self.0).await;
            Ok(json!(null))
        }
    }
}
