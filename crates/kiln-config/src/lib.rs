//! KDL configuration parsing for kiln.
//!
//! This crate handles parsing of the `kiln.kdl` file: store location, worker
//! pool size, manager tuning and job-definition checks.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{DEFAULT_CONFIG_FILE, KilnConfig, parse_config};
