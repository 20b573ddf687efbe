//! System configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "kiln.kdl";

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KilnConfig {
    /// Directory of the filesystem store.
    pub store_path: PathBuf,
    /// Maximum number of jobs run concurrently by the parallel worker.
    pub workers: usize,
    /// Downgrade references to vanished jobs from fatal errors to warnings.
    pub tolerate_db_inconsistencies: bool,
    /// Add jobs defined by dynamic jobs to the running targets.
    pub recurse: bool,
    /// Upper bound on a single wait for job completion.
    pub poll_interval: Duration,
    /// Jobs running longer than this are marked failed.
    pub job_timeout: Option<Duration>,
    /// Host failures tolerated per job before the job is marked failed.
    pub max_host_failures: u32,
    /// Verify the manager's set partition after every step.
    pub check_invariants: bool,
    /// Compare arguments of redefined jobs and invalidate them on change.
    pub check_params: bool,
    /// Largest numeric suffix tried when generating job ids.
    pub max_job_id_suffix: u32,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(".kiln"),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            tolerate_db_inconsistencies: false,
            recurse: false,
            poll_interval: Duration::from_millis(100),
            job_timeout: None,
            max_host_failures: 3,
            check_invariants: cfg!(debug_assertions),
            check_params: false,
            max_job_id_suffix: 1000,
        }
    }
}

impl KilnConfig {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        parse_config(&content)
    }

    /// Like [`KilnConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No configuration file, using defaults");
            Ok(Self::default())
        }
    }
}

/// Parse configuration from KDL text. Unset values keep their defaults.
pub fn parse_config(kdl: &str) -> ConfigResult<KilnConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = KilnConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "store" => {
                if let Some(path) =
                    get_string_prop(node, "path").or_else(|| get_first_string_arg(node))
                {
                    config.store_path = PathBuf::from(path);
                }
            }
            "workers" => {
                config.workers = get_u64_arg(node, "workers")? as usize;
                if config.workers == 0 {
                    return Err(invalid("workers", "must be at least 1"));
                }
            }
            "tolerate-db-inconsistencies" => {
                config.tolerate_db_inconsistencies =
                    get_bool_arg(node, "tolerate-db-inconsistencies")?;
            }
            "manager" => parse_manager(node, &mut config)?,
            "definitions" => parse_definitions(node, &mut config)?,
            other => debug!(node = other, "Ignoring unknown configuration node"),
        }
    }

    Ok(config)
}

fn parse_manager(node: &KdlNode, config: &mut KilnConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        match child.name().value() {
            "recurse" => config.recurse = get_bool_arg(child, "manager.recurse")?,
            "poll-interval-ms" => {
                let ms = get_u64_arg(child, "manager.poll-interval-ms")?;
                if ms == 0 {
                    return Err(invalid("manager.poll-interval-ms", "must be positive"));
                }
                config.poll_interval = Duration::from_millis(ms);
            }
            "job-timeout-secs" => {
                let secs = get_u64_arg(child, "manager.job-timeout-secs")?;
                config.job_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "max-host-failures" => {
                config.max_host_failures = get_u64_arg(child, "manager.max-host-failures")? as u32;
            }
            "check-invariants" => {
                config.check_invariants = get_bool_arg(child, "manager.check-invariants")?;
            }
            other => debug!(node = other, "Ignoring unknown manager setting"),
        }
    }
    Ok(())
}

fn parse_definitions(node: &KdlNode, config: &mut KilnConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        match child.name().value() {
            "check-params" => {
                config.check_params = get_bool_arg(child, "definitions.check-params")?;
            }
            "max-job-id-suffix" => {
                let max = get_u64_arg(child, "definitions.max-job-id-suffix")?;
                if max == 0 {
                    return Err(invalid("definitions.max-job-id-suffix", "must be positive"));
                }
                config.max_job_id_suffix = max as u32;
            }
            other => debug!(node = other, "Ignoring unknown definitions setting"),
        }
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

fn get_first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    get_first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_arg(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    get_first_arg(node)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| invalid(field, "expected #true or #false"))
}

fn get_u64_arg(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = get_first_arg(node)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| invalid(field, "expected an integer"))?;
    u64::try_from(value).map_err(|_| invalid(field, format!("{} is out of range", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            store path="/tmp/kiln-store"
            workers 8
            tolerate-db-inconsistencies #true

            manager {
                recurse #true
                poll-interval-ms 25
                job-timeout-secs 600
                max-host-failures 5
                check-invariants #false
            }

            definitions {
                check-params #true
                max-job-id-suffix 50
            }
        "#;

        let config = parse_config(kdl).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/tmp/kiln-store"));
        assert_eq!(config.workers, 8);
        assert!(config.tolerate_db_inconsistencies);
        assert!(config.recurse);
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert_eq!(config.job_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.max_host_failures, 5);
        assert!(!config.check_invariants);
        assert!(config.check_params);
        assert_eq!(config.max_job_id_suffix, 50);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, KilnConfig::default());
        assert!(config.job_timeout.is_none());
        assert!(!config.recurse);
    }

    #[test]
    fn test_unknown_nodes_are_ignored() {
        let config = parse_config("colors #true\nmanager { fancy 1 }").unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let result = parse_config("workers \"many\"");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = parse_config("manager {\n recurse 1\n}");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(parse_config("workers 0").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = KilnConfig::load_or_default(&dir.path().join("kiln.kdl")).unwrap();
        assert_eq!(config, KilnConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.kdl");
        std::fs::write(&path, "store \".cache\"\nworkers 2\n").unwrap();
        let config = KilnConfig::load(&path).unwrap();
        assert_eq!(config.store_path, PathBuf::from(".cache"));
        assert_eq!(config.workers, 2);
    }
}
