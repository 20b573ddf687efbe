//! Job identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;

use crate::{Error, Result};

/// Sentinel at the bottom of every `defined_by` stack.
pub const ROOT_JOB: &str = "root";

/// Longest accepted job id, in bytes. Keeps every record key a valid file
/// name in the filesystem store even when hex-encoded.
pub const MAX_JOB_ID_LEN: usize = 110;

/// A unique, human-readable job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a JobId without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a JobId, rejecting empty, overlong and whitespace-containing ids.
    pub fn parse(id: &str) -> Result<Self> {
        Self::validate(id)?;
        Ok(Self(id.to_string()))
    }

    pub fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::user("job id cannot be empty"));
        }
        if id.len() > MAX_JOB_ID_LEN {
            return Err(Error::user(format!(
                "job id {:?} is longer than {} bytes",
                id, MAX_JOB_ID_LEN
            )));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(Error::user(format!(
                "job id {:?} cannot contain whitespace",
                id
            )));
        }
        Ok(())
    }

    /// The `root` sentinel used at the bottom of definition stacks.
    pub fn root() -> Self {
        Self(ROOT_JOB.to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_JOB
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for JobId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
