//! ClickHouse history table.
//!
//! The table is append-only: removing a migration writes a row with
//! `is_deleted = 1`, and `ReplacingMergeTree(apply_time)` keeps the newest
//! row per version once `OPTIMIZE ... FINAL` has merged the parts.
//!
//! On a non-replicated cluster a `Distributed` table `d_<table>` is created
//! next to the base table and every read goes through it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{collect_migrations, limit_clause, now, Migration, Repository};
use crate::conn::{Conn, TxFn};
use crate::context::Context;
use crate::dsn::Driver;
use crate::error::{DbError, MigrateError, Result};
use crate::value::Value;

/// History table on ClickHouse.
pub struct ClickHouseRepository {
    conn: Arc<Conn>,
    database: String,
    table: String,
    cluster_name: String,
    replicated: bool,
}

impl ClickHouseRepository {
    /// Creates the repository. Identifiers must already be validated.
    pub(crate) fn new(
        conn: Arc<Conn>,
        database: String,
        table: String,
        cluster_name: String,
        replicated: bool,
    ) -> Self {
        Self {
            conn,
            database,
            table,
            cluster_name,
            replicated,
        }
    }

    /// Non-replicated tables on a named cluster get a distributed alias.
    #[must_use]
    pub fn is_cluster(&self) -> bool {
        !self.replicated && !self.cluster_name.is_empty()
    }

    fn base_table(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    fn distributed_table(&self) -> String {
        format!("{}.d_{}", self.database, self.table)
    }

    /// Table every read goes to.
    #[must_use]
    pub fn read_table(&self) -> String {
        if self.is_cluster() {
            self.distributed_table()
        } else {
            self.base_table()
        }
    }

    fn on_cluster(&self) -> String {
        if self.is_cluster() {
            format!(" ON CLUSTER {}", self.cluster_name)
        } else {
            String::new()
        }
    }

    fn engine(&self) -> String {
        if self.replicated || self.is_cluster() {
            format!(
                "ReplicatedReplacingMergeTree('/clickhouse/tables/{{shard}}/{}_{}', '{{replica}}', apply_time)",
                self.cluster_name, self.table
            )
        } else {
            "ReplacingMergeTree(apply_time)".to_string()
        }
    }

    /// DDL issued by `create_migration_history_table`, in order.
    #[must_use]
    pub fn create_statements(&self) -> Vec<String> {
        let mut statements = vec![format!(
            "CREATE TABLE {}{} (version String, date Date DEFAULT toDate(apply_time), apply_time UInt32, is_deleted UInt8) \
             ENGINE = {} PRIMARY KEY (version) PARTITION BY (toYYYYMM(date)) ORDER BY (version) \
             SETTINGS index_granularity=8192",
            self.base_table(),
            self.on_cluster(),
            self.engine(),
        )];
        if self.is_cluster() {
            statements.push(format!(
                "CREATE TABLE {}{} AS {} ENGINE = Distributed('{}','{}',{}, cityHash64(toString(version)))",
                self.distributed_table(),
                self.on_cluster(),
                self.base_table(),
                self.cluster_name,
                self.database,
                self.table,
            ));
        }
        statements
    }

    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<()> {
        self.conn
            .exec(ctx, query, args)
            .await
            .map(|_| ())
            .map_err(|err| translate(err, query))
    }

    async fn scalar(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Value> {
        self.conn
            .query(ctx, query, args)
            .await
            .and_then(|rows| rows.scalar())
            .map_err(|err| translate(err, query))
    }

    /// Appends a history row, then merges so the newest row wins.
    async fn append(&self, ctx: &Context, version: &str, is_deleted: u8) -> Result<()> {
        let insert = format!(
            "INSERT INTO {} (version, apply_time, is_deleted) VALUES (?, ?, ?)",
            self.base_table()
        );
        let args = vec![
            Value::from(version),
            Value::from(now()),
            Value::from(is_deleted),
        ];
        let conn = &self.conn;
        let insert_ref = insert.as_str();
        self.exec_query_transaction(
            ctx,
            crate::conn::tx_fn(move |tx_ctx| async move {
                conn.exec(&tx_ctx, insert_ref, &args).await?;
                Ok(())
            }),
        )
        .await?;

        let optimize = format!("OPTIMIZE TABLE {}{} FINAL", self.base_table(), self.on_cluster());
        self.exec(ctx, &optimize, &[]).await
    }
}

#[async_trait]
impl Repository for ClickHouseRepository {
    fn driver(&self) -> Driver {
        Driver::ClickHouse
    }

    fn table_name_with_schema(&self) -> String {
        self.base_table()
    }

    fn force_safely(&self) -> bool {
        true
    }

    async fn migrations(&self, ctx: &Context, limit: usize) -> Result<Vec<Migration>> {
        let query = format!(
            "SELECT version, apply_time FROM {} WHERE is_deleted = 0 ORDER BY apply_time DESC, version DESC{}",
            self.read_table(),
            limit_clause(limit)
        );
        let rows = self
            .conn
            .query(ctx, &query, &[])
            .await
            .map_err(|err| translate(err, &query))?;
        collect_migrations(rows)
    }

    async fn has_migration_history_table(&self, ctx: &Context) -> Result<bool> {
        let query = "SELECT COUNT(*) FROM system.columns WHERE table = ? AND database = currentDatabase()";
        let count: u64 = self
            .scalar(ctx, query, &[Value::from(self.table.as_str())])
            .await?
            .get()?;
        Ok(count > 0)
    }

    async fn create_migration_history_table(&self, ctx: &Context) -> Result<()> {
        for statement in self.create_statements() {
            debug!(table = %self.base_table(), "creating clickhouse history table");
            self.exec(ctx, &statement, &[]).await?;
        }
        Ok(())
    }

    async fn drop_migration_history_table(&self, ctx: &Context) -> Result<()> {
        let suffix = if self.is_cluster() {
            format!(" ON CLUSTER {} NO DELAY", self.cluster_name)
        } else {
            String::new()
        };
        if self.is_cluster() {
            let query = format!("DROP TABLE {}{suffix}", self.distributed_table());
            self.exec(ctx, &query, &[]).await?;
        }
        let query = format!("DROP TABLE {}{suffix}", self.base_table());
        self.exec(ctx, &query, &[]).await
    }

    async fn insert_migration(&self, ctx: &Context, version: &str) -> Result<()> {
        self.append(ctx, version, 0).await
    }

    async fn remove_migration(&self, ctx: &Context, version: &str) -> Result<()> {
        self.append(ctx, version, 1).await
    }

    async fn migrations_count(&self, ctx: &Context) -> Result<usize> {
        let query = format!("SELECT COUNT(*) FROM {} WHERE is_deleted = 0", self.read_table());
        self.scalar(ctx, &query, &[]).await?.get()
    }

    async fn exists_migration(&self, ctx: &Context, version: &str) -> Result<bool> {
        let query = format!(
            "SELECT COUNT(*) FROM {} WHERE version = ? AND is_deleted = 0",
            self.read_table()
        );
        let count: u64 = self.scalar(ctx, &query, &[Value::from(version)]).await?.get()?;
        Ok(count > 0)
    }

    async fn exec_query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<()> {
        self.exec(ctx, query, args).await
    }

    async fn query_scalar(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Value> {
        self.scalar(ctx, query, args).await
    }

    async fn exec_query_transaction<'a>(&'a self, ctx: &'a Context, f: TxFn<'a>) -> Result<()> {
        self.conn.transaction(ctx, f).await
    }
}

/// Wraps ClickHouse exceptions into [`DbError`].
fn translate(err: MigrateError, query: &str) -> MigrateError {
    let MigrateError::ClickHouse(exception) = &err else {
        return err;
    };
    DbError {
        code: exception.code.to_string(),
        severity: "ERROR".to_string(),
        message: exception.message.clone(),
        details: exception.name.clone(),
        internal_query: query.to_string(),
        cause: Box::new(err),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClickHouseException;
    use crate::repository::testing::mock_conn;

    fn build(cluster: &str, replicated: bool) -> (ClickHouseRepository, crate::conn::mock::MockHandle) {
        let (conn, handle) = mock_conn("clickhouse://default:@localhost:8123/default");
        let repo = ClickHouseRepository::new(
            conn,
            "default".into(),
            "migrates".into(),
            cluster.into(),
            replicated,
        );
        (repo, handle)
    }

    #[tokio::test]
    async fn test_create_clustered() {
        let (repo, handle) = build("test_cluster", false);
        assert!(repo.is_cluster());
        repo.create_migration_history_table(&Context::new())
            .await
            .unwrap();

        let queries = handle.queries();
        assert_eq!(queries.len(), 2);
        assert!(queries[0].starts_with(
            "CREATE TABLE default.migrates ON CLUSTER test_cluster (version String, date Date DEFAULT toDate(apply_time), apply_time UInt32, is_deleted UInt8) \
             ENGINE = ReplicatedReplacingMergeTree('/clickhouse/tables/{shard}/test_cluster_migrates', '{replica}', apply_time)"
        ));
        assert!(queries[0].ends_with(
            "PRIMARY KEY (version) PARTITION BY (toYYYYMM(date)) ORDER BY (version) SETTINGS index_granularity=8192"
        ));
        assert_eq!(
            queries[1],
            "CREATE TABLE default.d_migrates ON CLUSTER test_cluster AS default.migrates \
             ENGINE = Distributed('test_cluster','default',migrates, cityHash64(toString(version)))"
        );
        assert_eq!(repo.read_table(), "default.d_migrates");
    }

    #[tokio::test]
    async fn test_create_standalone() {
        let (repo, handle) = build("", false);
        assert!(!repo.is_cluster());
        repo.create_migration_history_table(&Context::new())
            .await
            .unwrap();
        let queries = handle.queries();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].contains("ENGINE = ReplacingMergeTree(apply_time)"));
        assert!(!queries[0].contains("ON CLUSTER"));
        assert_eq!(repo.read_table(), "default.migrates");
    }

    #[tokio::test]
    async fn test_create_replicated_without_distributed() {
        let (repo, handle) = build("test_cluster", true);
        assert!(!repo.is_cluster());
        repo.create_migration_history_table(&Context::new())
            .await
            .unwrap();
        let queries = handle.queries();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].contains("ReplicatedReplacingMergeTree('/clickhouse/tables/{shard}/test_cluster_migrates'"));
        assert!(!queries[0].contains("ON CLUSTER"));
    }

    #[tokio::test]
    async fn test_insert_and_remove_append_rows() {
        let (repo, handle) = build("test_cluster", false);
        let ctx = Context::new();
        repo.insert_migration(&ctx, "210328_221600_a").await.unwrap();
        repo.remove_migration(&ctx, "210328_221600_a").await.unwrap();

        let statements = handle.statements();
        assert_eq!(statements.len(), 4);
        assert_eq!(
            statements[0].query,
            "INSERT INTO default.migrates (version, apply_time, is_deleted) VALUES (?, ?, ?)"
        );
        assert!(statements[0].transactional);
        assert_eq!(statements[0].args[0], Value::from("210328_221600_a"));
        assert_eq!(statements[0].args[2], Value::UInt(0));
        assert_eq!(
            statements[1].query,
            "OPTIMIZE TABLE default.migrates ON CLUSTER test_cluster FINAL"
        );
        assert!(!statements[1].transactional);
        assert_eq!(statements[2].args[2], Value::UInt(1));
        assert_eq!(handle.commits(), 2);
    }

    #[tokio::test]
    async fn test_reads_filter_deleted() {
        let (repo, handle) = build("test_cluster", false);
        handle.respond(
            "SELECT version",
            vec![Value::Tuple(vec![Value::from("210328_221600_a"), Value::UInt(1_616_969_760)])],
        );
        handle.respond("COUNT(*)", vec![Value::UInt(1)]);
        let ctx = Context::new();

        let migrations = repo.migrations(&ctx, 5).await.unwrap();
        assert_eq!(migrations[0].version, "210328_221600_a");
        assert_eq!(migrations[0].apply_time, 1_616_969_760);
        assert!(repo.exists_migration(&ctx, "210328_221600_a").await.unwrap());
        assert_eq!(repo.migrations_count(&ctx).await.unwrap(), 1);

        let queries = handle.queries();
        assert_eq!(
            queries[0],
            "SELECT version, apply_time FROM default.d_migrates WHERE is_deleted = 0 ORDER BY apply_time DESC, version DESC LIMIT 5"
        );
        assert!(queries.iter().all(|q| q.contains("d_migrates")));
    }

    #[tokio::test]
    async fn test_has_table() {
        let (repo, handle) = build("", false);
        handle.respond("system.columns", vec![Value::UInt(4)]);
        assert!(repo.has_migration_history_table(&Context::new()).await.unwrap());
        let statements = handle.statements();
        assert_eq!(statements[0].args, vec![Value::from("migrates")]);

        let (repo, handle) = build("", false);
        handle.respond("system.columns", vec![Value::UInt(0)]);
        assert!(!repo.has_migration_history_table(&Context::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_clustered() {
        let (repo, handle) = build("test_cluster", false);
        repo.drop_migration_history_table(&Context::new())
            .await
            .unwrap();
        assert_eq!(
            handle.queries(),
            vec![
                "DROP TABLE default.d_migrates ON CLUSTER test_cluster NO DELAY",
                "DROP TABLE default.migrates ON CLUSTER test_cluster NO DELAY",
            ]
        );
    }

    #[test]
    fn test_translate_exception() {
        let err = translate(
            MigrateError::ClickHouse(ClickHouseException {
                code: 60,
                name: "UNKNOWN_TABLE".into(),
                message: "Table default.x does not exist.".into(),
            }),
            "SELECT 1 FROM default.x",
        );
        let db = err.as_db_error().unwrap();
        assert_eq!(db.code, "60");
        assert_eq!(db.details, "UNKNOWN_TABLE");
        assert_eq!(db.internal_query, "SELECT 1 FROM default.x");
        assert!(matches!(*db.cause, MigrateError::ClickHouse(_)));

        let passthrough = translate(MigrateError::Cancelled, "SELECT 1");
        assert!(matches!(passthrough, MigrateError::Cancelled));
    }

    #[test]
    fn test_forces_safe_mode() {
        let (repo, _) = build("", false);
        assert!(repo.force_safely());
        assert_eq!(repo.table_name_with_schema(), "default.migrates");
    }
}
