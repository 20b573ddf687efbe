//! Job definition and execution for kiln.
//!
//! - [`Context`] declares jobs and persists their definitions
//! - [`job_compute`] resolves a job's arguments and runs its command
//! - [`make`] runs a job and records its outcome in the store
//! - [`SerialWorker`] and [`ParallelWorker`] hand jobs to the manager

pub mod builtin;
pub mod compute;
pub mod context;
pub mod make;
pub mod parallel;
pub mod registry;
pub mod serial;

pub use builtin::builtin_registry;
pub use compute::{ComputeError, ComputeOutput, job_compute};
pub use context::{Context, JobBuilder, same_computation};
pub use make::{hostname, make, mark_as_blocked, mark_as_failed};
pub use parallel::ParallelWorker;
pub use registry::{Command, CommandError, CommandRegistry, CommandResult, Invocation};
pub use serial::SerialWorker;
