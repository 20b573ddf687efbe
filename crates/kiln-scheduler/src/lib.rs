//! Job scheduling for kiln.
//!
//! Decides which jobs to run and in which order, and drives them through a
//! worker until every target is done, failed or blocked.

pub mod manager;
pub mod priority;
pub mod queue;
pub mod state;

pub use manager::{InterruptHandle, Manager, ManagerSummary, make_targets};
pub use priority::{DYNAMIC_BASE_PRIORITY, HistoryStats, JobStats, compute_priority};
pub use queue::ReadyQueue;
pub use state::JobSets;
