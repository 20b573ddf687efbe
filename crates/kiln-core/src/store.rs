//! Persistent key/value store contract.
//!
//! Every job owns up to four keys, derived from its id by [`keys`]. Single-key
//! operations must be atomic; multi-key updates are built on top with retry loops.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("key {key} does not fit the store's name limit of {limit} bytes")]
    KeyTooLong { key: String, limit: usize },

    #[error("store lock poisoned")]
    Poisoned,
}

/// A byte-oriented key/value store shared by every worker.
pub trait Store: Send + Sync {
    /// Name of the backend, for logs.
    fn name(&self) -> &'static str;

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn contains(&self, key: &str) -> Result<bool, StoreError>;

    /// All keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Size in bytes of the stored value.
    fn sizeof(&self, key: &str) -> Result<u64, StoreError>;
}

/// Key namespaces.
pub mod keys {
    use crate::JobId;

    pub const JOB_PREFIX: &str = "cm-job-";
    pub const CACHE_PREFIX: &str = "cm-cache-";
    pub const RESULT_PREFIX: &str = "cm-res-";
    pub const ARGS_PREFIX: &str = "cm-args-";

    pub fn job(id: &JobId) -> String {
        format!("{}{}", JOB_PREFIX, id)
    }

    pub fn cache(id: &JobId) -> String {
        format!("{}{}", CACHE_PREFIX, id)
    }

    pub fn result(id: &JobId) -> String {
        format!("{}{}", RESULT_PREFIX, id)
    }

    pub fn args(id: &JobId) -> String {
        format!("{}{}", ARGS_PREFIX, id)
    }
}
