//! clean and delete.

use anyhow::Result;
use kiln_db_queries::{clean_targets, delete_jobs_cascading};

use super::Session;
use crate::EXIT_SUCCESS;

pub fn clean(session: &Session, targets: &[String]) -> Result<u8> {
    let selected = session.resolve_targets(targets, false)?;
    let mut cq = session.query();
    let report = clean_targets(&mut cq, &selected)?;
    println!(
        "Cleaned {} jobs, deleted {} defined jobs, updated {} relations",
        report.cleaned.len(),
        report.deleted.len(),
        report.relations_cleaned.len()
    );
    Ok(EXIT_SUCCESS)
}

pub fn delete(session: &Session, targets: &[String]) -> Result<u8> {
    let selected = session.resolve_targets(targets, false)?;
    let mut cq = session.query();
    let deleted = delete_jobs_cascading(&mut cq, &selected)?;
    for job_id in &deleted {
        println!("deleted {}", job_id);
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use crate::commands::tests::{kiln, open};
    use kiln_core::JobId;
    use kiln_db as db;

    #[tokio::test]
    async fn test_clean_keeps_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();
        kiln(d, &["define", "echo", "--id", "a", "--arg", "1"]).await.unwrap();
        kiln(d, &["make"]).await.unwrap();
        kiln(d, &["clean", "a"]).await.unwrap();

        let store = open(d);
        let a = JobId::from("a");
        assert!(db::job_exists(store.as_ref(), &a).unwrap());
        assert!(!db::get_job_cache(store.as_ref(), &a).unwrap().is_done());
    }

    #[tokio::test]
    async fn test_delete_removes_job() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();
        kiln(d, &["define", "echo", "--id", "a"]).await.unwrap();
        kiln(d, &["delete", "a"]).await.unwrap();
        let store = open(d);
        assert!(!db::job_exists(store.as_ref(), &JobId::from("a")).unwrap());
    }
}
