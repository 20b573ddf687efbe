//! Graph queries over the kiln job store.
//!
//! [`CacheQueryDB`] answers "is this job up to date" and "what must run to
//! bring these targets up to date" with per-session memoization. The
//! [`clean`] module invalidates and deletes jobs; [`consistency`] audits the
//! stored graph.

pub mod clean;
pub mod consistency;
pub mod query;

pub use clean::{
    CleanReport, clean_cache_relations, clean_targets, delete_jobs_cascading,
    delete_jobs_defined_by, mark_to_remake,
};
pub use consistency::check_consistency;
pub use query::{CacheQueryDB, TodoTargets, UpToDate};
