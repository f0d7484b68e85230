//! MySQL history table.
//!
//! Generated statements use the bare table name, so the connection must
//! already be scoped to the target database. `table_name_with_schema` still
//! reports `database.table`.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::mysql::MySqlDatabaseError;

use super::{collect_migrations, limit_clause, now, Migration, Repository};
use crate::conn::{Conn, TxFn};
use crate::context::Context;
use crate::dsn::Driver;
use crate::error::{DbError, MigrateError, Result};
use crate::value::Value;

/// History table on MySQL.
pub struct MySqlRepository {
    conn: Arc<Conn>,
    database: String,
    table: String,
}

impl MySqlRepository {
    /// Creates the repository. Identifiers must already be validated.
    pub(crate) fn new(conn: Arc<Conn>, database: String, table: String) -> Self {
        Self {
            conn,
            database,
            table,
        }
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
}

#[async_trait]
impl Repository for MySqlRepository {
    fn driver(&self) -> Driver {
        Driver::MySql
    }

    fn table_name_with_schema(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    async fn migrations(&self, ctx: &Context, limit: usize) -> Result<Vec<Migration>> {
        let query = format!(
            "SELECT version, apply_time FROM {} ORDER BY apply_time DESC, version DESC{}",
            self.table,
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
        let query = "SELECT EXISTS(SELECT * FROM information_schema.tables \
                     WHERE table_name = ? AND table_schema = ?)";
        let args = [
            Value::from(self.table.as_str()),
            Value::from(self.database.as_str()),
        ];
        self.scalar(ctx, query, &args).await?.get()
    }

    async fn create_migration_history_table(&self, ctx: &Context) -> Result<()> {
        let query = format!(
            "CREATE TABLE {} (version VARCHAR(180) PRIMARY KEY, apply_time INT) ENGINE=InnoDB",
            self.table
        );
        self.exec(ctx, &query, &[]).await
    }

    async fn drop_migration_history_table(&self, ctx: &Context) -> Result<()> {
        let query = format!("DROP TABLE {}", self.table);
        self.exec(ctx, &query, &[]).await
    }

    async fn insert_migration(&self, ctx: &Context, version: &str) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (version, apply_time) VALUES (?, ?)",
            self.table
        );
        self.exec(ctx, &query, &[Value::from(version), Value::from(now())])
            .await
    }

    async fn remove_migration(&self, ctx: &Context, version: &str) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE version = ?", self.table);
        self.exec(ctx, &query, &[Value::from(version)]).await
    }

    async fn migrations_count(&self, ctx: &Context) -> Result<usize> {
        let query = format!("SELECT COUNT(*) FROM {}", self.table);
        self.scalar(ctx, &query, &[]).await?.get()
    }

    async fn exists_migration(&self, ctx: &Context, version: &str) -> Result<bool> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE version = ?)",
            self.table
        );
        self.scalar(ctx, &query, &[Value::from(version)]).await?.get()
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

/// Wraps MySQL server errors into [`DbError`], keyed by the numeric code.
fn translate(err: MigrateError, query: &str) -> MigrateError {
    let MigrateError::Sqlx(sqlx::Error::Database(db)) = &err else {
        return err;
    };
    let Some(my) = db.try_downcast_ref::<MySqlDatabaseError>() else {
        return err;
    };
    let code = my.number().to_string();
    let message = my.message().to_string();
    let details = my.code().unwrap_or_default().to_string();
    DbError {
        code,
        severity: "ERROR".to_string(),
        message,
        details,
        internal_query: query.to_string(),
        cause: Box::new(err),
    }
    .into()
}
