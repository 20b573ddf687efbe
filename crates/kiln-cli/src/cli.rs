//! Command-line arguments.

use clap::{Parser, Subcommand};
use kiln_config::DEFAULT_CONFIG_FILE;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "kiln")]
#[command(about = "Incremental job-graph orchestrator", long_about = None)]
pub struct Cli {
    /// Store directory (overrides the configuration file)
    #[arg(long, env = "KILN_STORE")]
    pub store: Option<PathBuf>,

    /// Configuration file
    #[arg(long, env = "KILN_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Declare a job running a registered command
    Define {
        /// Registered command name
        command: String,
        /// Job id (derived from the command name when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Positional argument as JSON; plain text is taken as a string
        #[arg(long = "arg")]
        args: Vec<String>,
        /// Keyword argument as NAME=JSON
        #[arg(long = "kwarg")]
        kwargs: Vec<String>,
        /// Extra dependency on another job
        #[arg(long = "dep")]
        deps: Vec<String>,
        /// The command defines further jobs
        #[arg(long)]
        dynamic: bool,
    },
    /// Bring jobs up to date, one at a time
    Make {
        /// Jobs to make (all top-level jobs when empty)
        targets: Vec<String>,
        /// Also make jobs defined by dynamic jobs
        #[arg(long)]
        recurse: bool,
    },
    /// Bring jobs up to date in parallel
    Parmake {
        /// Jobs to make (all top-level jobs when empty)
        targets: Vec<String>,
        /// Maximum number of concurrent jobs
        #[arg(short = 'n', long)]
        jobs: Option<usize>,
        /// Also make jobs defined by dynamic jobs
        #[arg(long)]
        recurse: bool,
    },
    /// Recompute jobs even if they are up to date
    Remake {
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// Forget the results of jobs, keeping their definitions
    Clean {
        /// Jobs to clean (all top-level jobs when empty)
        targets: Vec<String>,
    },
    /// Delete jobs and everything they defined
    Delete {
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// List jobs and their state
    Ls {
        /// Jobs to list (all jobs when empty)
        targets: Vec<String>,
    },
    /// Show everything stored about a job
    Details { job: String },
    /// Check the store for inconsistencies
    CheckConsistency,
    /// Summarize job states and command history
    Stats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_define() {
        let cli = Cli::try_parse_from([
            "kiln", "--store", "/tmp/s", "define", "echo", "--id", "a", "--arg", "1", "--arg",
            "hello", "--kwarg", "cwd=\"/\"",
        ])
        .unwrap();
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/s")));
        match cli.command {
            Commands::Define {
                command, id, args, kwargs, dynamic, ..
            } => {
                assert_eq!(command, "echo");
                assert_eq!(id.as_deref(), Some("a"));
                assert_eq!(args, vec!["1", "hello"]);
                assert_eq!(kwargs, vec!["cwd=\"/\""]);
                assert!(!dynamic);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_parmake() {
        let cli = Cli::try_parse_from(["kiln", "parmake", "-n", "4", "a", "b"]).unwrap();
        match cli.command {
            Commands::Parmake { targets, jobs, .. } => {
                assert_eq!(targets, vec!["a", "b"]);
                assert_eq!(jobs, Some(4));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_remake_needs_targets() {
        assert!(Cli::try_parse_from(["kiln", "remake"]).is_err());
    }
}
