//! Job declaration from the command line.

use anyhow::Result;
use kiln_core::{Error, JobId, Promise};
use kiln_db as db;
use serde_json::Value;
use tracing::debug;

use super::Session;
use crate::EXIT_SUCCESS;

/// Arguments of `kiln define`.
#[derive(Debug, Clone, Default)]
pub struct DefineRequest {
    pub command: String,
    pub id: Option<String>,
    pub args: Vec<String>,
    pub kwargs: Vec<String>,
    pub deps: Vec<String>,
    pub dynamic: bool,
}

/// JSON if it parses, otherwise the text itself as a string.
fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn parse_kwarg(text: &str) -> Result<(String, Value), Error> {
    match text.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), parse_value(value))),
        _ => Err(Error::user(format!(
            "keyword argument {:?} is not of the form NAME=VALUE",
            text
        ))),
    }
}

/// Each invocation is its own session, so an implicit id must not land on a
/// job an earlier invocation declared.
fn fresh_job_id(session: &Session, command: &str) -> Result<String> {
    let store = session.store.as_ref();
    let mut candidate = command.to_string();
    for n in 2..=session.config.max_job_id_suffix + 1 {
        if !db::job_exists(store, &JobId::new(candidate.as_str()))? {
            debug!(command, job_id = %candidate, "Generated job id");
            return Ok(candidate);
        }
        candidate = format!("{}-{}", command, n);
    }
    Err(Error::user(format!(
        "no free job id for {}; pass --id explicitly",
        command
    ))
    .into())
}

pub fn define(session: &Session, request: DefineRequest) -> Result<u8> {
    let id = match request.id {
        Some(id) => id,
        None => fresh_job_id(session, &request.command)?,
    };
    let mut context = session.context();
    let mut builder = if request.dynamic {
        context.comp_dynamic(request.command)
    } else {
        context.comp(request.command)
    };
    builder = builder.job_id(id);
    for arg in &request.args {
        builder = builder.arg(parse_value(arg));
    }
    for kwarg in &request.kwargs {
        let (name, value) = parse_kwarg(kwarg)?;
        builder = builder.kwarg(name, value);
    }
    for dep in &request.deps {
        builder = builder.extra_dep(&Promise::new(JobId::parse(dep)?));
    }
    let promise = builder.define()?;
    println!("{}", promise.job_id());
    Ok(EXIT_SUCCESS)
}
