//! Filesystem store: one file per key.
//!
//! Writes go to a temporary file that is renamed over the target, so readers in
//! other processes see either the old or the new value. Keys made only of
//! `[A-Za-z0-9._-]` are used as file names directly; any other key is stored as
//! `~` followed by its hex encoding.

use kiln_core::{Store, StoreError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

const ENCODED_MARKER: char = '~';
/// Longest file name common filesystems accept.
const MAX_FILE_NAME: usize = 255;
const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    temp_counter: AtomicU64,
}

impl FsStore {
    /// Open the store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            key: root.display().to_string(),
            source,
        })?;
        debug!(root = %root.display(), "Opened filesystem store");
        Ok(Self {
            root,
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(encode_key(key))
    }

    /// Path for a key about to be written; rejects keys whose file name
    /// would be too long.
    fn writable_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let name = encode_key(key);
        if name.len() > MAX_FILE_NAME {
            return Err(StoreError::KeyTooLong {
                key: key.to_string(),
                limit: MAX_FILE_NAME,
            });
        }
        Ok(self.root.join(name))
    }
}

fn is_plain(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn encode_key(key: &str) -> String {
    if is_plain(key) {
        key.to_string()
    } else {
        format!("{}{}", ENCODED_MARKER, hex::encode(key))
    }
}

fn decode_file_name(name: &str) -> Option<String> {
    if name.starts_with('.') {
        return None;
    }
    match name.strip_prefix(ENCODED_MARKER) {
        Some(encoded) => hex::decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok()),
        None => Some(name.to_string()),
    }
}

fn io_error(key: &str, source: std::io::Error) -> StoreError {
    if source.kind() == ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Io {
            key: key.to_string(),
            source,
        }
    }
}

impl Store for FsStore {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        std::fs::read(self.path_for(key)).map_err(|e| io_error(key, e))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let target = self.writable_path(key)?;
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp = self
            .root
            .join(format!("{}{}-{}", TEMP_PREFIX, std::process::id(), n));
        std::fs::write(&temp, value).map_err(|e| io_error(key, e))?;
        std::fs::rename(&temp, target).map_err(|e| {
            let _ = std::fs::remove_file(&temp);
            io_error(key, e)
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(key).is_file())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| io_error(prefix, e))?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(prefix, e))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                warn!(file = ?file_name, "Skipping non UTF-8 file in store");
                continue;
            };
            if let Some(key) = decode_file_name(name) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn sizeof(&self, key: &str) -> Result<u64, StoreError> {
        std::fs::metadata(self.path_for(key))
            .map(|m| m.len())
            .map_err(|e| io_error(key, e))
    }
}
