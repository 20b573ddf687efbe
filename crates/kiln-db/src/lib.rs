//! Persistent job store for kiln.
//!
//! Provides the store backends and typed accessors for the four per-job
//! records (definition, cache, result, arguments).

pub mod fs;
pub mod memory;
pub mod retry;
pub mod storage;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use retry::{db_job_add_dynamic_children, db_job_add_parent, update_job_with_retry};
pub use storage::*;

use kiln_core::{Result, Store};
use std::path::Path;
use std::sync::Arc;

/// Open (creating if needed) the filesystem store at `path`.
pub fn open_store(path: &Path) -> Result<Arc<dyn Store>> {
    Ok(Arc::new(FsStore::open(path)?))
}
