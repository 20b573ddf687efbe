//! make, parmake and remake.

use anyhow::Result;
use kiln_core::{Event, Worker};
use kiln_db_queries::mark_to_remake;
use kiln_executor::{ParallelWorker, SerialWorker};
use kiln_scheduler::{Manager, ManagerSummary};
use std::sync::Arc;
use tracing::{info, warn};

use super::Session;
use crate::{EXIT_JOBS_FAILED, EXIT_SUCCESS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Serial,
    Parallel(usize),
}

fn print_event(event: &Event) {
    match event {
        Event::ManagerJobProcessing { job_id } => println!("▶ {}", job_id),
        Event::ManagerJobDone { job_id } => println!("✓ {}", job_id),
        Event::ManagerJobFailed { job_id, reason } => println!("✗ {}: {}", job_id, reason),
        Event::ManagerJobBlocked {
            job_id,
            blocking_job_id,
        } => println!("⊘ {} (blocked by {})", job_id, blocking_job_id),
        Event::ManagerHostFailed { job_id, reason } => {
            println!("! {}: host failed: {}", job_id, reason)
        }
        _ => {}
    }
}

fn print_summary(summary: &ManagerSummary) {
    println!(
        "\n{} done, {} failed, {} blocked",
        summary.done.len(),
        summary.failed.len(),
        summary.blocked.len()
    );
    for job_id in &summary.failed {
        println!("  ✗ {}", job_id);
    }
    for job_id in &summary.blocked {
        println!("  ⊘ {}", job_id);
    }
}

/// Bring `targets` up to date with the chosen worker.
pub async fn make(
    session: &Session,
    targets: &[String],
    kind: WorkerKind,
    recurse: bool,
) -> Result<u8> {
    let targets = session.resolve_targets(targets, false)?;

    let mut config = (*session.config).clone();
    config.recurse |= recurse;
    let config = Arc::new(config);
    let context = session.context_with(config.clone());
    let worker: Arc<dyn Worker> = match kind {
        WorkerKind::Serial => Arc::new(SerialWorker::new(context)),
        WorkerKind::Parallel(jobs) => Arc::new(ParallelWorker::new(context, jobs)),
    };
    info!(targets = targets.len(), worker = worker.name(), "Making targets");

    let mut events = session.events.subscribe();
    let mut manager = Manager::new(
        session.store.clone(),
        worker,
        config,
        session.events.clone(),
    )?;
    manager.add_targets(targets)?;

    let interrupt = manager.interrupt_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            interrupt.interrupt();
        }
    });

    let result = {
        let process = manager.process();
        tokio::pin!(process);
        loop {
            tokio::select! {
                result = &mut process => break result,
                Some(event) = events.recv() => print_event(&event),
            }
        }
    };
    ctrl_c.abort();
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }

    let summary = result?;
    print_summary(&summary);
    Ok(if summary.is_success() {
        EXIT_SUCCESS
    } else {
        EXIT_JOBS_FAILED
    })
}

/// Force `targets` to be recomputed, then make them.
pub async fn remake(session: &Session, targets: &[String]) -> Result<u8> {
    let selected = session.resolve_targets(targets, false)?;
    let mut cq = session.query();
    for job_id in &selected {
        if !mark_to_remake(&mut cq, job_id)? {
            info!(job_id = %job_id, "Job was not done, making it normally");
        }
    }
    make(session, targets, WorkerKind::Serial, false).await
}
