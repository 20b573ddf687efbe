//! Registered commands: the user computations jobs refer to by name.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::Context;

/// Why a command did not produce a value.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Failed(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("interrupted")]
    Interrupted,

    /// Defining a job from inside a dynamic command failed.
    #[error("job definition failed: {0}")]
    Define(#[from] kiln_core::Error),
}

impl CommandError {
    pub fn failed(message: impl Into<String>) -> Self {
        CommandError::Failed(message.into())
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        CommandError::Failed(format!("bad value: {}", e))
    }
}

pub type CommandResult = std::result::Result<Value, CommandError>;

/// Resolved arguments handed to a command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl Invocation {
    pub fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Deserialize positional argument `index`.
    pub fn arg_as<T: DeserializeOwned>(&self, index: usize) -> Result<T, CommandError> {
        let value = self
            .arg(index)
            .ok_or_else(|| CommandError::failed(format!("missing argument {}", index)))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Deserialize keyword argument `name`, if present.
    pub fn kwarg_as<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CommandError> {
        self.kwarg(name)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(CommandError::from)
    }
}

/// A user computation.
///
/// Dynamic jobs receive a [`Context`] through which they may define more
/// jobs; static jobs receive `None`.
#[async_trait]
pub trait Command: Send + Sync {
    async fn run(&self, context: Option<&mut Context>, invocation: Invocation) -> CommandResult;
}

struct FnCommand<F>(F);

#[async_trait]
impl<F> Command for FnCommand<F>
where
    F: Fn(Invocation) -> CommandResult + Send + Sync,
{
    async fn run(&self, _context: Option<&mut Context>, invocation: Invocation) -> CommandResult {
        (self.0)(invocation)
    }
}

struct DynamicFnCommand<F>(F);

#[async_trait]
impl<F> Command for DynamicFnCommand<F>
where
    F: Fn(&mut Context, Invocation) -> CommandResult + Send + Sync,
{
    async fn run(&self, context: Option<&mut Context>, invocation: Invocation) -> CommandResult {
        match context {
            Some(context) => (self.0)(context, invocation),
            None => Err(CommandError::failed(
                "command defines jobs but was run without a context",
            )),
        }
    }
}

/// Name-to-command table shared by the definition engine and every worker.
///
/// A job can only be defined for a registered command, which is what lets
/// any worker holding the same registry run it.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, command: impl Command + 'static) {
        self.commands.insert(name.into(), Arc::new(command));
    }

    /// Register a plain function as a static command.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Invocation) -> CommandResult + Send + Sync + 'static,
    {
        self.register(name, FnCommand(f));
    }

    /// Register a function that defines further jobs through its context.
    pub fn register_dynamic_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut Context, Invocation) -> CommandResult + Send + Sync + 'static,
    {
        self.register(name, DynamicFnCommand(f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}
