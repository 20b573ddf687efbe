//! The kiln console.
//!
//! The `kiln` binary runs it with the builtin commands; programs with their
//! own commands call [`console::main_with_registry`] instead.

pub mod cli;
pub mod commands;
pub mod console;

pub use cli::{Cli, Commands};
pub use console::{main_with_registry, run_cli};

use kiln_config::ConfigError;

pub const EXIT_SUCCESS: u8 = 0;
/// Store or I/O failure outside any job.
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_USER_ERROR: u8 = 2;
/// Some jobs failed or were blocked.
pub const EXIT_JOBS_FAILED: u8 = 113;
pub const EXIT_BUG: u8 = 114;
pub const EXIT_INTERRUPTED: u8 = 130;

/// Exit status for an error that stopped a command.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<kiln_core::Error>() {
        return match e {
            kiln_core::Error::User(_) | kiln_core::Error::JobNotFound(_) => EXIT_USER_ERROR,
            kiln_core::Error::Interrupted(_) => EXIT_INTERRUPTED,
            e if e.is_bug() => EXIT_BUG,
            _ => EXIT_ERROR,
        };
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_USER_ERROR;
    }
    EXIT_ERROR
}
