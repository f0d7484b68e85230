//! Engine scenarios over an in-memory history table.

mod common;

use std::sync::Arc;

use common::{migration_dir, write_files, MemoryRepository};
use dbshift::prelude::*;

const A: &str = "210328_221600_a";
const B: &str = "210329_121500_b";
const C: &str = "210330_080000_c";

fn executor(repo: &Arc<MemoryRepository>, dir: &std::path::Path) -> Executor {
    let repo: Arc<dyn Repository> = repo.clone();
    Executor::new(repo, dir)
}

fn standard_dir() -> tempfile::TempDir {
    migration_dir(&[
        ("210328_221600_a.up.sql", "CREATE TABLE t(id int);"),
        ("210328_221600_a.down.sql", "DROP TABLE t;"),
        ("210329_121500_b.up.sql", "INSERT INTO t VALUES(1);"),
        ("210329_121500_b.down.sql", "DELETE FROM t WHERE id = 1;"),
    ])
}

#[tokio::test]
async fn test_fresh_up_applies_in_order() {
    let dir = standard_dir();
    let (repo, handle) = MemoryRepository::new(Driver::Postgres);
    let summary = executor(&repo, dir.path())
        .up(&Context::new(), Limit::All)
        .await
        .unwrap();

    assert!(repo.has_table());
    assert_eq!(summary.applied, vec![A, B]);
    assert_eq!(repo.versions(), vec![A, B]);
    assert!(repo.apply_time(A).unwrap() <= repo.apply_time(B).unwrap());
    assert_eq!(
        handle.queries(),
        vec!["CREATE TABLE t(id int)", "INSERT INTO t VALUES(1)"]
    );
    let inserts = handle
        .queries()
        .iter()
        .filter(|q| q.starts_with("INSERT INTO t"))
        .count();
    assert_eq!(inserts, 1);
}

#[tokio::test]
async fn test_up_is_idempotent_and_limited() {
    let dir = standard_dir();
    let (repo, handle) = MemoryRepository::new(Driver::Postgres);
    let exec = executor(&repo, dir.path());
    let ctx = Context::new();

    let first = exec.up(&ctx, Limit::Count(1)).await.unwrap();
    assert_eq!(first.applied, vec![A]);
    let second = exec.up(&ctx, Limit::All).await.unwrap();
    assert_eq!(second.applied, vec![B]);
    let third = exec.up(&ctx, Limit::All).await.unwrap();
    assert!(third.is_empty());
    assert_eq!(handle.queries().len(), 2);
}

#[tokio::test]
async fn test_down_reverts_newest_first() {
    let dir = standard_dir();
    let (repo, handle) = MemoryRepository::new(Driver::MySql);
    repo.seed(&[A, B]);
    let exec = executor(&repo, dir.path());

    let summary = exec.down(&Context::new(), Limit::Count(1)).await.unwrap();
    assert_eq!(summary.reverted, vec![B]);
    assert_eq!(repo.versions(), vec![A]);

    let summary = exec.down(&Context::new(), Limit::All).await.unwrap();
    assert_eq!(summary.reverted, vec![A]);
    assert!(repo.versions().is_empty());
    assert_eq!(
        handle.queries(),
        vec!["DELETE FROM t WHERE id = 1", "DROP TABLE t"]
    );
}

#[tokio::test]
async fn test_down_without_history_table_is_noop() {
    let dir = standard_dir();
    let (repo, handle) = MemoryRepository::new(Driver::Postgres);
    let summary = executor(&repo, dir.path())
        .down(&Context::new(), Limit::Count(1))
        .await
        .unwrap();
    assert!(summary.is_empty());
    assert!(!repo.has_table());
    assert!(handle.statements().is_empty());
}

#[tokio::test]
async fn test_redo_single() {
    let dir = standard_dir();
    let (repo, handle) = MemoryRepository::new(Driver::Postgres);
    repo.seed(&[A, B]);
    let before = repo.apply_time(B).unwrap();

    let summary = executor(&repo, dir.path())
        .redo(&Context::new(), Limit::Count(1))
        .await
        .unwrap();

    assert_eq!(summary.reverted, vec![B]);
    assert_eq!(summary.applied, vec![B]);
    assert_eq!(repo.versions(), vec![A, B]);
    assert!(repo.apply_time(B).unwrap() > before);
    assert_eq!(
        handle.queries(),
        vec!["DELETE FROM t WHERE id = 1", "INSERT INTO t VALUES(1)"]
    );
}

#[tokio::test]
async fn test_redo_many_reapplies_oldest_first() {
    let dir = standard_dir();
    let (repo, _handle) = MemoryRepository::new(Driver::Postgres);
    repo.seed(&[A, B]);
    let summary = executor(&repo, dir.path())
        .redo(&Context::new(), Limit::All)
        .await
        .unwrap();
    assert_eq!(summary.reverted, vec![B, A]);
    assert_eq!(summary.applied, vec![A, B]);
    assert_eq!(repo.versions(), vec![A, B]);
}

#[tokio::test]
async fn test_failure_reports_progress_and_stops() {
    let dir = standard_dir();
    write_files(dir.path(), &[("210330_080000_c.up.sql", "SELECT 1;")]);
    let (repo, handle) = MemoryRepository::new(Driver::Postgres);
    handle.fail("INSERT INTO t", "duplicate key");

    let err = executor(&repo, dir.path())
        .up(&Context::new(), Limit::All)
        .await
        .unwrap_err();

    match err {
        MigrateError::MigrationFailed {
            version,
            done,
            total,
            ..
        } => {
            assert_eq!(version, B);
            assert_eq!(done, 1);
            assert_eq!(total, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(repo.versions(), vec![A]);
    assert!(!handle.queries().iter().any(|q| q == "SELECT 1"));
}

#[tokio::test]
async fn test_safe_script_rolls_back_as_a_whole() {
    let dir = migration_dir(&[(
        "210328_221600_a.safe.up.sql",
        "INSERT INTO t VALUES(1);\nINSERT INTO broken VALUES(2);",
    )]);
    let (repo, handle) = MemoryRepository::new(Driver::Postgres);
    handle.fail("broken", "relation does not exist");

    let err = executor(&repo, dir.path())
        .up(&Context::new(), Limit::All)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("0 of 1 applied"));
    assert!(handle.statements().is_empty());
    assert_eq!(handle.rollbacks(), 1);
    assert!(repo.versions().is_empty());
}

#[tokio::test]
async fn test_safe_script_commits_before_recording() {
    let dir = migration_dir(&[(
        "210328_221600_a.safe.up.sql",
        "INSERT INTO t VALUES(1);\nINSERT INTO t VALUES(2);",
    )]);
    let (repo, handle) = MemoryRepository::new(Driver::Postgres);
    executor(&repo, dir.path())
        .up(&Context::new(), Limit::All)
        .await
        .unwrap();
    let statements = handle.statements();
    assert_eq!(statements.len(), 2);
    assert!(statements.iter().all(|s| s.transactional));
    assert_eq!(handle.commits(), 1);
    assert_eq!(repo.versions(), vec![A]);
}

#[tokio::test]
async fn test_forced_safe_mode_wraps_unsafe_scripts() {
    let dir = standard_dir();
    let (repo, handle) = MemoryRepository::forcing_safe_mode(Driver::ClickHouse);
    executor(&repo, dir.path())
        .up(&Context::new(), Limit::All)
        .await
        .unwrap();
    assert_eq!(handle.begins(), 2);
    assert!(handle.statements().iter().all(|s| s.transactional));
}

#[tokio::test]
async fn test_missing_down_script_fails_before_running() {
    let dir = migration_dir(&[
        ("210328_221600_a.up.sql", "CREATE TABLE t(id int);"),
        ("210328_221600_a.down.sql", "DROP TABLE t;"),
        ("210329_121500_b.up.sql", "INSERT INTO t VALUES(1);"),
    ]);
    let (repo, handle) = MemoryRepository::new(Driver::Postgres);
    repo.seed(&[A, B]);

    let err = executor(&repo, dir.path())
        .down(&Context::new(), Limit::All)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::MigrationNotFound(ref v) if v == B));
    assert!(handle.statements().is_empty());
    assert_eq!(repo.versions(), vec![A, B]);
}

#[tokio::test]
async fn test_to_moves_both_ways() {
    let dir = standard_dir();
    write_files(
        dir.path(),
        &[
            ("210330_080000_c.up.sql", "SELECT 3;"),
            ("210330_080000_c.down.sql", "SELECT -3;"),
        ],
    );
    let (repo, _handle) = MemoryRepository::new(Driver::Postgres);
    let exec = executor(&repo, dir.path());
    let ctx = Context::new();

    let summary = exec.to(&ctx, B).await.unwrap();
    assert_eq!(summary.applied, vec![A, B]);
    assert_eq!(repo.versions(), vec![A, B]);

    let summary = exec.to(&ctx, C).await.unwrap();
    assert_eq!(summary.applied, vec![C]);

    let summary = exec.to(&ctx, A).await.unwrap();
    assert_eq!(summary.reverted, vec![C, B]);
    assert_eq!(repo.versions(), vec![A]);

    assert!(exec.to(&ctx, A).await.unwrap().is_empty());
    assert!(matches!(
        exec.to(&ctx, "990101_000000_missing").await,
        Err(MigrateError::MigrationNotFound(_))
    ));
    assert!(matches!(
        exec.to(&ctx, "latest").await,
        Err(MigrateError::InvalidVersion(_))
    ));
}

#[tokio::test]
async fn test_history_and_new() {
    let dir = standard_dir();
    let (repo, _handle) = MemoryRepository::new(Driver::Tarantool);
    let exec = executor(&repo, dir.path());
    let ctx = Context::new();

    assert!(exec.history(&ctx, Limit::All).await.unwrap().is_empty());
    let pending = exec.history_new(&ctx, Limit::All).await.unwrap();
    assert_eq!(
        pending.iter().map(|f| f.version.as_str()).collect::<Vec<_>>(),
        vec![A, B]
    );
    assert!(!repo.has_table());

    repo.seed(&[A]);
    let history = exec.history(&ctx, Limit::Count(10)).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, A);
    let pending = exec.history_new(&ctx, Limit::Count(1)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].version, B);
}

#[tokio::test]
async fn test_interactive_decline_runs_nothing() {
    let dir = standard_dir();
    let (repo, handle) = MemoryRepository::new(Driver::Postgres);
    let summary = executor(&repo, dir.path())
        .interactive(Arc::new(FixedPrompter(false)))
        .up(&Context::new(), Limit::All)
        .await
        .unwrap();
    assert!(summary.declined);
    assert!(summary.is_empty());
    assert!(handle.statements().is_empty());
    assert!(repo.versions().is_empty());
}

#[tokio::test]
async fn test_cancelled_context_aborts() {
    let dir = standard_dir();
    let (repo, handle) = MemoryRepository::new(Driver::Postgres);
    let ctx = Context::new();
    ctx.cancel();
    let err = executor(&repo, dir.path())
        .up(&ctx, Limit::All)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrateError::MigrationFailed { ref source, done: 0, .. } if matches!(**source, MigrateError::Cancelled)
    ));
    assert!(handle.statements().is_empty());
    assert!(repo.versions().is_empty());
}

#[tokio::test]
async fn test_create_writes_empty_pair() {
    let dir = tempfile::TempDir::new().unwrap();
    let target = dir.path().join("nested");
    let (repo, _handle) = MemoryRepository::new(Driver::Postgres);
    let exec = executor(&repo, &target);

    let (up, down) = exec.create("create_users").unwrap().unwrap();
    assert!(up.exists() && down.exists());
    assert_eq!(std::fs::read_to_string(&up).unwrap(), "");
    let up_file = MigrationFile::parse(&up).unwrap();
    assert!(up_file.safely);
    assert!(up_file.version.ends_with("_create_users"));

    let pending = exec.history_new(&Context::new(), Limit::All).await.unwrap();
    assert_eq!(pending.len(), 1);

    assert!(matches!(
        exec.create("bad name"),
        Err(MigrateError::InvalidMigrationName(_))
    ));
    let declined = executor(&repo, &target)
        .interactive(Arc::new(FixedPrompter(false)))
        .create("other")
        .unwrap();
    assert!(declined.is_none());
}

#[tokio::test]
async fn test_service_mixes_files_and_raw_scripts() {
    let dir = standard_dir();
    let (repo, handle) = MemoryRepository::new(Driver::Postgres);
    let options = ServiceOptions {
        migration_path: dir.path().to_path_buf(),
        interactive: true,
        ..ServiceOptions::default()
    };
    let service = Service::with_prompter(repo.clone(), &options, Arc::new(FixedPrompter(true)));
    let ctx = Context::new();

    let summary = service.up(&ctx, Limit::All).await.unwrap();
    assert_eq!(summary.applied, vec![A, B]);

    service
        .upgrade(&ctx, C, "INSERT INTO t VALUES(3);", true)
        .await
        .unwrap();
    assert_eq!(repo.versions(), vec![A, B, C]);
    assert!(handle.statements().last().unwrap().transactional);

    assert!(matches!(
        service.upgrade(&ctx, C, "SELECT 1;", false).await,
        Err(MigrateError::MigrationAlreadyExists(_))
    ));
    service
        .downgrade(&ctx, C, "DELETE FROM t WHERE id = 3;", false)
        .await
        .unwrap();
    assert_eq!(repo.versions(), vec![A, B]);
    service.close().await.unwrap();
}
