//! CLI command implementations.

pub mod clean;
pub mod define;
pub mod inspect;
pub mod make;

use anyhow::{Context as _, Result};
use kiln_config::KilnConfig;
use kiln_core::{Error, EventBus, JobId, Store};
use kiln_db_queries::CacheQueryDB;
use kiln_executor::{CommandRegistry, Context};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::{Cli, Commands};

/// Everything a command needs: the opened store, the merged configuration
/// and the commands jobs may run.
pub struct Session {
    pub store: Arc<dyn Store>,
    pub config: Arc<KilnConfig>,
    pub registry: Arc<CommandRegistry>,
    pub events: EventBus,
}

impl Session {
    pub fn open(cli: &Cli, registry: CommandRegistry) -> Result<Self> {
        let mut config = KilnConfig::load_or_default(&cli.config)
            .with_context(|| format!("Failed to load configuration: {}", cli.config.display()))?;
        if let Some(store) = &cli.store {
            config.store_path = store.clone();
        }
        debug!(store = %config.store_path.display(), "Opening store");
        let store = kiln_db::open_store(&config.store_path)
            .with_context(|| format!("Failed to open store: {}", config.store_path.display()))?;
        Ok(Self {
            store,
            config: Arc::new(config),
            registry: Arc::new(registry),
            events: EventBus::new(),
        })
    }

    /// A top-level definition session, optionally with a tweaked configuration.
    pub fn context_with(&self, config: Arc<KilnConfig>) -> Context {
        Context::new(
            self.store.clone(),
            self.registry.clone(),
            config,
            self.events.clone(),
        )
    }

    pub fn context(&self) -> Context {
        self.context_with(self.config.clone())
    }

    pub fn query(&self) -> CacheQueryDB {
        CacheQueryDB::new(self.store.clone(), self.config.tolerate_db_inconsistencies)
    }

    /// Parse and check job ids given on the command line. With no ids, the
    /// jobs declared at top level (or every job, with `all_when_empty`).
    pub fn resolve_targets(
        &self,
        targets: &[String],
        all_when_empty: bool,
    ) -> Result<BTreeSet<JobId>> {
        let mut cq = self.query();
        if targets.is_empty() {
            let mut selected = BTreeSet::new();
            for job_id in cq.all_jobs()? {
                if all_when_empty || cq.get_job(&job_id)?.definition_depth() == 0 {
                    selected.insert(job_id);
                }
            }
            return Ok(selected);
        }
        let mut selected = BTreeSet::new();
        for target in targets {
            let job_id = JobId::parse(target)?;
            if !cq.job_exists(&job_id)? {
                return Err(Error::JobNotFound(job_id).into());
            }
            selected.insert(job_id);
        }
        Ok(selected)
    }
}

/// Run one parsed command line. Returns the process exit status.
pub async fn run(cli: Cli, registry: CommandRegistry) -> Result<u8> {
    let session = Session::open(&cli, registry)?;
    match cli.command {
        Commands::Define {
            command,
            id,
            args,
            kwargs,
            deps,
            dynamic,
        } => {
            let request = define::DefineRequest {
                command,
                id,
                args,
                kwargs,
                deps,
                dynamic,
            };
            define::define(&session, request)
        }
        Commands::Make { targets, recurse } => {
            make::make(&session, &targets, make::WorkerKind::Serial, recurse).await
        }
        Commands::Parmake {
            targets,
            jobs,
            recurse,
        } => {
            let jobs = jobs.unwrap_or(session.config.workers);
            make::make(&session, &targets, make::WorkerKind::Parallel(jobs), recurse).await
        }
        Commands::Remake { targets } => make::remake(&session, &targets).await,
        Commands::Clean { targets } => clean::clean(&session, &targets),
        Commands::Delete { targets } => clean::delete(&session, &targets),
        Commands::Ls { targets } => inspect::ls(&session, &targets),
        Commands::Details { job } => inspect::details(&session, &job),
        Commands::CheckConsistency => inspect::check_consistency(&session),
        Commands::Stats => inspect::stats(&session),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{EXIT_JOBS_FAILED, EXIT_SUCCESS, EXIT_USER_ERROR, exit_code};
    use clap::Parser;
    use kiln_core::CacheState;
    use kiln_db as db;
    use kiln_executor::builtin_registry;
    use serde_json::json;
    use std::path::Path;

    pub(crate) async fn kiln(dir: &Path, args: &[&str]) -> Result<u8> {
        let store = dir.join("store");
        let config = dir.join("kiln.kdl");
        let mut argv = vec![
            "kiln".to_string(),
            "--store".to_string(),
            store.display().to_string(),
            "--config".to_string(),
            config.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        let cli = Cli::try_parse_from(argv)?;
        run(cli, builtin_registry()).await
    }

    pub(crate) fn open(dir: &Path) -> Arc<dyn Store> {
        kiln_db::open_store(&dir.join("store")).unwrap()
    }

    #[tokio::test]
    async fn test_define_and_make() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();
        let code = kiln(d, &["define", "echo", "--id", "a", "--arg", "1"]).await.unwrap();
        assert_eq!(code, EXIT_SUCCESS);
        assert_eq!(
            kiln(d, &["define", "echo", "--id", "b", "--arg", r#"{"$promise": "a"}"#])
                .await
                .unwrap(),
            EXIT_SUCCESS
        );
        assert_eq!(kiln(d, &["make"]).await.unwrap(), EXIT_SUCCESS);

        let store = open(d);
        assert_eq!(db::get_job_userobject(store.as_ref(), &JobId::from("b")).unwrap(), json!(1));
        assert!(db::get_job(store.as_ref(), &JobId::from("a")).unwrap().parents.contains("b"));
    }

    #[tokio::test]
    async fn test_failed_job_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();
        kiln(d, &["define", "shell", "--id", "boom", "--arg", "exit 3"]).await.unwrap();
        kiln(d, &["define", "echo", "--id", "after", "--dep", "boom"]).await.unwrap();

        assert_eq!(kiln(d, &["parmake", "-n", "2"]).await.unwrap(), EXIT_JOBS_FAILED);
        let store = open(d);
        let after = db::get_job_cache(store.as_ref(), &JobId::from("after")).unwrap();
        assert_eq!(after.state, CacheState::Blocked);
    }

    #[tokio::test]
    async fn test_unknown_target_is_a_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = kiln(dir.path(), &["make", "missing"]).await.unwrap_err();
        assert_eq!(exit_code(&err), EXIT_USER_ERROR);

        let err = kiln(dir.path(), &["define", "no-such-command"]).await.unwrap_err();
        assert_eq!(exit_code(&err), EXIT_USER_ERROR);
    }

    #[tokio::test]
    async fn test_config_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kiln.kdl"), "workers \"many\"\n").unwrap();
        let err = kiln(dir.path(), &["ls"]).await.unwrap_err();
        assert_eq!(exit_code(&err), EXIT_USER_ERROR);
    }
}
