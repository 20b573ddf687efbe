//! Core types and contracts for the kiln incremental job orchestrator.
//!
//! This crate contains:
//! - Job identifiers and the error taxonomy
//! - Persisted job records (definition, cache, arguments)
//! - Promise encoding for job references inside JSON values
//! - The key/value `Store` contract
//! - The worker and result-handle contract used by the manager
//! - Typed events and the event bus

pub mod error;
pub mod events;
pub mod id;
pub mod job;
pub mod promise;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
pub use events::{Event, EventBus, JobSetsSnapshot};
pub use id::{JobId, MAX_JOB_ID_LEN, ROOT_JOB};
pub use job::{Cache, CacheState, FailureKind, Job, JobArgs, JobTimestamp};
pub use promise::Promise;
pub use store::{Store, StoreError};
pub use worker::{JobCompletion, JobFailure, MakeOutcome, ResultHandle, Worker};
