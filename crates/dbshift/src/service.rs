//! Library entry point.
//!
//! [`Service`] ties a connection, its repository and the file-driven
//! [`Executor`] together. Besides the file operations it can apply or revert
//! a single migration given as raw script text.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::conn::Conn;
use crate::context::Context;
use crate::error::{MigrateError, Result};
use crate::executor::{run_statements, Executor, Limit, Summary};
use crate::files::MigrationFile;
use crate::prompt::{Prompter, StdinPrompter};
use crate::repository::{self, Migration, Repository, RepositoryOptions, DEFAULT_TABLE_NAME};
use crate::scanner::statements;

/// Default number of connection attempts.
pub const DEFAULT_MAX_CONNECTION_ATTEMPTS: i32 = 1;

/// Everything needed to build a [`Service`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Target DSN.
    pub dsn: String,
    /// Directory holding the migration scripts.
    pub migration_path: PathBuf,
    /// History table, optionally `schema.table`.
    pub table_name: String,
    /// ClickHouse cluster name.
    pub cluster_name: String,
    /// Whether the ClickHouse history table is replicated.
    pub replicated: bool,
    /// Log statements at debug level only.
    pub compact: bool,
    /// Ask before running a plan or creating files.
    pub interactive: bool,
    /// Attempts made by [`Service::connect`].
    pub max_connection_attempts: i32,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            migration_path: PathBuf::from("migrations"),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            cluster_name: String::new(),
            replicated: false,
            compact: false,
            interactive: false,
            max_connection_attempts: DEFAULT_MAX_CONNECTION_ATTEMPTS,
        }
    }
}

impl ServiceOptions {
    /// The repository part of the options.
    #[must_use]
    pub fn repository_options(&self) -> RepositoryOptions {
        RepositoryOptions {
            table_name: self.table_name.clone(),
            cluster_name: self.cluster_name.clone(),
            replicated: self.replicated,
        }
    }
}

/// Migrations against one database.
pub struct Service {
    conn: Option<Arc<Conn>>,
    repo: Arc<dyn Repository>,
    executor: Executor,
    compact: bool,
}

impl Service {
    /// Connects (retrying as configured) and builds the repository.
    pub async fn connect(options: &ServiceOptions) -> Result<Self> {
        if options.dsn.is_empty() {
            return Err(MigrateError::Config("a DSN is required".into()));
        }
        let conn = Arc::new(Conn::try_connect(&options.dsn, options.max_connection_attempts).await?);
        info!(driver = %conn.driver(), hosts = ?conn.dsn().hosts, "Connected");
        Self::with_conn(conn, options)
    }

    /// Builds the service on an existing connection.
    pub fn with_conn(conn: Arc<Conn>, options: &ServiceOptions) -> Result<Self> {
        let repo = repository::create(Arc::clone(&conn), &options.repository_options())?;
        let mut service = Self::with_repository(repo, options);
        service.conn = Some(conn);
        Ok(service)
    }

    /// Builds the service on an existing repository.
    pub fn with_repository(repo: Arc<dyn Repository>, options: &ServiceOptions) -> Self {
        let prompter: Arc<dyn Prompter> = Arc::new(StdinPrompter);
        Self::with_prompter(repo, options, prompter)
    }

    /// Like [`Service::with_repository`], answering prompts with `prompter`
    /// when the options ask for interactive mode.
    pub fn with_prompter(
        repo: Arc<dyn Repository>,
        options: &ServiceOptions,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        let mut executor =
            Executor::new(Arc::clone(&repo), &options.migration_path).compact(options.compact);
        if options.interactive {
            executor = executor.interactive(prompter);
        }
        Self {
            conn: None,
            repo,
            executor,
            compact: options.compact,
        }
    }

    /// The history repository.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Applies `sql` as migration `version` and records it.
    pub async fn upgrade(&self, ctx: &Context, version: &str, sql: &str, safely: bool) -> Result<()> {
        if self.repo.exists_migration(ctx, version).await? {
            return Err(MigrateError::MigrationAlreadyExists(version.to_string()));
        }
        let script = statements(sql).collect::<Result<Vec<_>>>()?;
        let safely = safely || self.repo.force_safely();
        run_statements(self.repo.as_ref(), ctx, script, safely, self.compact).await?;
        self.repo.insert_migration(ctx, version).await?;
        info!(version, "Upgraded");
        Ok(())
    }

    /// Runs `sql` to revert migration `version` and forgets it.
    pub async fn downgrade(&self, ctx: &Context, version: &str, sql: &str, safely: bool) -> Result<()> {
        if !self.repo.exists_migration(ctx, version).await? {
            return Err(MigrateError::AppliedMigrationNotFound(version.to_string()));
        }
        let script = statements(sql).collect::<Result<Vec<_>>>()?;
        let safely = safely || self.repo.force_safely();
        run_statements(self.repo.as_ref(), ctx, script, safely, self.compact).await?;
        self.repo.remove_migration(ctx, version).await?;
        info!(version, "Downgraded");
        Ok(())
    }

    /// See [`Executor::up`].
    pub async fn up(&self, ctx: &Context, limit: Limit) -> Result<Summary> {
        self.executor.up(ctx, limit).await
    }

    /// See [`Executor::down`].
    pub async fn down(&self, ctx: &Context, limit: Limit) -> Result<Summary> {
        self.executor.down(ctx, limit).await
    }

    /// See [`Executor::redo`].
    pub async fn redo(&self, ctx: &Context, limit: Limit) -> Result<Summary> {
        self.executor.redo(ctx, limit).await
    }

    /// See [`Executor::to`].
    pub async fn to(&self, ctx: &Context, version: &str) -> Result<Summary> {
        self.executor.to(ctx, version).await
    }

    /// See [`Executor::history`].
    pub async fn history(&self, ctx: &Context, limit: Limit) -> Result<Vec<Migration>> {
        self.executor.history(ctx, limit).await
    }

    /// See [`Executor::history_new`].
    pub async fn history_new(&self, ctx: &Context, limit: Limit) -> Result<Vec<MigrationFile>> {
        self.executor.history_new(ctx, limit).await
    }

    /// See [`Executor::create`].
    pub fn create(&self, name: &str) -> Result<Option<(PathBuf, PathBuf)>> {
        self.executor.create(name)
    }

    /// Closes the connection, when the service owns one.
    pub async fn close(&self) -> Result<()> {
        match &self.conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::mock::{MockBackend, MockHandle};
    use crate::dsn::Dsn;
    use crate::value::Value;

    fn service(dsn: &str) -> (Service, MockHandle) {
        let dsn = Dsn::parse(dsn).unwrap();
        let backend = MockBackend::new(dsn.driver);
        let handle = backend.handle();
        let conn = Arc::new(Conn::with_backend(dsn, Box::new(backend)));
        let service = Service::with_conn(conn, &ServiceOptions::default()).unwrap();
        (service, handle)
    }

    #[tokio::test]
    async fn test_upgrade_runs_script_then_records() {
        let (service, handle) = service("postgres://u:p@localhost/db");
        handle.respond("SELECT EXISTS", vec![Value::Bool(false)]);
        service
            .upgrade(
                &Context::new(),
                "210328_221600_a",
                "CREATE TABLE t(id int);\nINSERT INTO t VALUES(1);",
                true,
            )
            .await
            .unwrap();

        let statements = handle.statements();
        let queries: Vec<&str> = statements.iter().map(|s| s.query.as_str()).collect();
        assert_eq!(
            &queries[1..],
            &[
                "CREATE TABLE t(id int)",
                "INSERT INTO t VALUES(1)",
                "INSERT INTO public.migration (version, apply_time) VALUES ($1, $2)",
            ]
        );
        assert!(statements[1].transactional && statements[2].transactional);
        assert!(!statements[3].transactional);
        assert_eq!(handle.commits(), 1);
    }

    #[tokio::test]
    async fn test_upgrade_existing_version() {
        let (service, handle) = service("postgres://u:p@localhost/db");
        handle.respond("SELECT EXISTS", vec![Value::Bool(true)]);
        let err = service
            .upgrade(&Context::new(), "210328_221600_a", "SELECT 1;", false)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::MigrationAlreadyExists(ref v) if v == "210328_221600_a"));
        assert_eq!(handle.statements().len(), 1);
    }

    #[tokio::test]
    async fn test_downgrade_missing_version() {
        let (service, handle) = service("mysql://u:p@localhost/app");
        handle.respond("SELECT EXISTS", vec![Value::Int(0)]);
        let err = service
            .downgrade(&Context::new(), "210328_221600_a", "DROP TABLE t;", false)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::AppliedMigrationNotFound(_)));
    }

    #[tokio::test]
    async fn test_downgrade_unsafe_runs_outside_transaction() {
        let (service, handle) = service("mysql://u:p@localhost/app");
        handle.respond("SELECT EXISTS", vec![Value::Int(1)]);
        service
            .downgrade(&Context::new(), "210328_221600_a", "DROP TABLE t;", false)
            .await
            .unwrap();
        let statements = handle.statements();
        assert_eq!(statements[1].query, "DROP TABLE t");
        assert!(!statements[1].transactional);
        assert_eq!(statements[2].query, "DELETE FROM migration WHERE version = ?");
        assert_eq!(handle.begins(), 0);
    }

    #[tokio::test]
    async fn test_connect_requires_dsn() {
        let err = Service::connect(&ServiceOptions::default()).await.err().unwrap();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[test]
    fn test_invalid_table_fails_before_any_statement() {
        let dsn = Dsn::parse("postgres://u:p@localhost/db").unwrap();
        let backend = MockBackend::new(dsn.driver);
        let handle = backend.handle();
        let conn = Arc::new(Conn::with_backend(dsn, Box::new(backend)));
        let options = ServiceOptions {
            table_name: "t;DROP".into(),
            ..ServiceOptions::default()
        };
        let err = Service::with_conn(conn, &options).err().unwrap();
        assert!(err.to_string().contains("invalid"));
        assert!(handle.statements().is_empty());
    }
}
