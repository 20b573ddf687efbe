//! Read-only commands: ls, details, check-consistency and stats.

use anyhow::Result;
use kiln_core::{CacheState, JobId};
use kiln_db as db;
use kiln_scheduler::HistoryStats;
use serde_json::json;
use std::collections::BTreeMap;

use super::Session;
use crate::{EXIT_BUG, EXIT_SUCCESS};

pub fn ls(session: &Session, targets: &[String]) -> Result<u8> {
    let selected = session.resolve_targets(targets, true)?;
    let mut cq = session.query();
    for job_id in &selected {
        let job = cq.get_job(job_id)?;
        let cache = cq.get_job_cache(job_id)?;
        let mut state = cache.state.to_string();
        if cache.is_done() && !cq.up_to_date(job_id)?.up_to_date {
            state.push_str(" (outdated)");
        }
        println!("{:<40} {:<20} {}", job_id.as_str(), state, job.command_desc);
    }
    Ok(EXIT_SUCCESS)
}

pub fn details(session: &Session, job: &str) -> Result<u8> {
    let job_id = JobId::parse(job)?;
    let mut cq = session.query();
    let definition = cq.get_job(&job_id)?;
    let cache = cq.get_job_cache(&job_id)?;
    let up_to_date = cq.up_to_date(&job_id)?;
    let store = session.store.as_ref();
    let args = if db::job_args_exists(store, &job_id)? {
        Some(db::get_job_args(store, &job_id)?)
    } else {
        None
    };
    let result = if db::job_userobject_exists(store, &job_id)? {
        Some(db::get_job_userobject(store, &job_id)?)
    } else {
        None
    };
    let report = json!({
        "job": definition,
        "cache": cache,
        "args": args,
        "result": result,
        "up_to_date": up_to_date,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(EXIT_SUCCESS)
}

pub fn check_consistency(session: &Session) -> Result<u8> {
    let problems = kiln_db_queries::check_consistency(session.store.as_ref())?;
    if problems.is_empty() {
        println!("No inconsistencies found");
        return Ok(EXIT_SUCCESS);
    }
    for problem in &problems {
        println!("{}", problem);
    }
    println!("{} inconsistencies found", problems.len());
    Ok(EXIT_BUG)
}

pub fn stats(session: &Session) -> Result<u8> {
    let store = session.store.as_ref();
    let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
    let jobs = db::all_jobs(store)?;
    for job_id in &jobs {
        let state = db::get_job_cache(store, job_id)?.state;
        *by_state.entry(state.to_string()).or_default() += 1;
    }
    println!("{} jobs", jobs.len());
    for state in [
        CacheState::NotStarted,
        CacheState::Processing,
        CacheState::Done,
        CacheState::Failed,
        CacheState::Blocked,
    ] {
        let count = by_state.get(&state.to_string()).copied().unwrap_or(0);
        println!("  {:<12} {}", state.to_string(), count);
    }

    let history = HistoryStats::from_store(store)?;
    let mut commands: Vec<_> = history.by_command.iter().collect();
    commands.sort_by(|a, b| a.0.cmp(b.0));
    if !commands.is_empty() {
        println!("\nSuccess rate by command:");
        for (command, stats) in commands {
            println!("  {:<20} {:.0}%", command, stats.prob_success * 100.0);
        }
    }
    Ok(EXIT_SUCCESS)
}
