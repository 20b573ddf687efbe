//! Running the command of a single job.

use futures::FutureExt;
use kiln_core::promise::substitute_promises;
use kiln_core::{Error, Job, JobId};
use kiln_db as db;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::{CommandError, Context, Invocation};

/// A successful computation.
#[derive(Debug, Clone)]
pub struct ComputeOutput {
    pub user_object: Value,
    /// Jobs declared by a dynamic job while it ran.
    pub new_jobs: BTreeSet<JobId>,
    /// Time spent loading the arguments and the results they refer to.
    pub int_load_results: Duration,
    pub int_compute: Duration,
    /// Reserved for post-run cleanup time; always zero.
    pub int_gc: Duration,
}

#[derive(Debug, Error)]
pub enum ComputeError {
    /// The command failed; `new_jobs` were declared before it did.
    #[error("{source}")]
    Command {
        source: CommandError,
        new_jobs: BTreeSet<JobId>,
    },

    /// Loading the job's inputs failed.
    #[error(transparent)]
    Internal(#[from] Error),
}

fn command_failed(source: CommandError, new_jobs: BTreeSet<JobId>) -> ComputeError {
    ComputeError::Command { source, new_jobs }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Resolve the arguments of `job` and run its command.
///
/// Dynamic jobs run in a child session of `context`; the jobs they declare
/// are reported as `new_jobs`. A panicking command is reported as a command
/// failure.
pub async fn job_compute(job: &Job, context: &Context) -> Result<ComputeOutput, ComputeError> {
    let store = context.store().clone();
    let job_id = &job.job_id;

    let load_start = Instant::now();
    let job_args = db::get_job_args(store.as_ref(), job_id)?;
    let mut resolve = |dep: &JobId| db::get_job_userobject_resolved(store.as_ref(), dep);
    let args = job_args
        .args
        .iter()
        .map(|v| substitute_promises(v, &mut resolve))
        .collect::<kiln_core::Result<Vec<_>>>()?;
    let mut kwargs = std::collections::BTreeMap::new();
    for (name, value) in &job_args.kwargs {
        kwargs.insert(name.clone(), substitute_promises(value, &mut resolve)?);
    }
    let int_load_results = load_start.elapsed();

    let Some(command) = context.registry().get(&job_args.command) else {
        return Err(command_failed(
            CommandError::failed(format!("command {} is not registered", job_args.command)),
            BTreeSet::new(),
        ));
    };
    let invocation = Invocation::new(args, kwargs);

    debug!(
        job_id = %job_id,
        command = %job_args.command,
        dynamic = job.needs_context,
        "Computing job"
    );
    let compute_start = Instant::now();
    let (outcome, new_jobs) = if job.needs_context {
        let mut session = context.child_session(job);
        let outcome = AssertUnwindSafe(command.run(Some(&mut session), invocation))
            .catch_unwind()
            .await;
        (outcome, session.into_jobs_defined())
    } else {
        let outcome = AssertUnwindSafe(command.run(None, invocation))
            .catch_unwind()
            .await;
        (outcome, BTreeSet::new())
    };
    let int_compute = compute_start.elapsed();

    match outcome {
        Ok(Ok(user_object)) => Ok(ComputeOutput {
            user_object,
            new_jobs,
            int_load_results,
            int_compute,
            int_gc: Duration::ZERO,
        }),
        Ok(Err(e)) => Err(command_failed(e, new_jobs)),
        Err(payload) => Err(command_failed(
            CommandError::failed(format!("command panicked: {}", panic_message(payload))),
            new_jobs,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{test_context, test_context_with, test_registry};
    use kiln_config::KilnConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolves_promises_before_running() {
        let mut ctx = test_context();
        let a = ctx.comp("value").arg(20).define().unwrap();
        let b = ctx.comp("value").arg(22).define().unwrap();
        let c = ctx.comp("sum").arg(&a).arg(&b).define().unwrap();
        let store = ctx.store().clone();
        db::set_job_userobject(store.as_ref(), a.job_id(), &json!(20)).unwrap();
        db::set_job_userobject(store.as_ref(), b.job_id(), &json!(22)).unwrap();

        let job = db::get_job(store.as_ref(), c.job_id()).unwrap();
        let out = job_compute(&job, &ctx).await.unwrap();
        assert_eq!(out.user_object, json!(42));
        assert!(out.new_jobs.is_empty());
    }

    #[tokio::test]
    async fn test_missing_dependency_result_is_bug() {
        let mut ctx = test_context();
        let a = ctx.comp("value").arg(1).define().unwrap();
        let c = ctx.comp("sum").arg(&a).define().unwrap();
        let job = db::get_job(ctx.store().as_ref(), c.job_id()).unwrap();
        match job_compute(&job, &ctx).await {
            Err(ComputeError::Internal(e)) => assert!(e.is_bug()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dynamic_job_reports_new_jobs() {
        let mut registry = test_registry();
        registry.register_dynamic_fn("gen", |ctx: &mut Context, inv: Invocation| {
            let n: u32 = inv.arg_as(0)?;
            let mut parts = Vec::new();
            for i in 0..n {
                parts.push(Value::from(&ctx.comp("value").arg(i).define()?));
            }
            Ok(Value::Array(parts))
        });
        let mut ctx = test_context_with(registry, KilnConfig::default());
        let g = ctx.comp_dynamic("gen").arg(2).define().unwrap();
        let job = db::get_job(ctx.store().as_ref(), g.job_id()).unwrap();

        let out = job_compute(&job, &ctx).await.unwrap();
        assert_eq!(out.new_jobs.len(), 2);
        for id in &out.new_jobs {
            let defined = db::get_job(ctx.store().as_ref(), id).unwrap();
            assert_eq!(defined.defined_by, vec![JobId::root(), g.job_id().clone()]);
        }
    }

    #[tokio::test]
    async fn test_panic_is_command_failure() {
        let mut registry = test_registry();
        registry.register_fn("boom", |_inv: Invocation| panic!("kaboom"));
        let mut ctx = test_context_with(registry, KilnConfig::default());
        let p = ctx.comp("boom").define().unwrap();
        let job = db::get_job(ctx.store().as_ref(), p.job_id()).unwrap();

        match job_compute(&job, &ctx).await {
            Err(ComputeError::Command { source, .. }) => {
                assert!(source.to_string().contains("kaboom"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
