//! PostgreSQL history table.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgDatabaseError, PgErrorPosition};

use super::{collect_migrations, limit_clause, now, Migration, Repository};
use crate::conn::{Conn, TxFn};
use crate::context::Context;
use crate::dsn::Driver;
use crate::error::{DbError, MigrateError, Result};
use crate::value::Value;

/// Schema used when the table name is not qualified.
pub const DEFAULT_SCHEMA: &str = "public";

/// History table on PostgreSQL, addressed as `schema.table`.
pub struct PostgresRepository {
    conn: Arc<Conn>,
    schema: String,
    table: String,
}

impl PostgresRepository {
    /// Creates the repository. Identifiers must already be validated.
    pub(crate) fn new(conn: Arc<Conn>, schema: String, table: String) -> Self {
        Self {
            conn,
            schema,
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
impl Repository for PostgresRepository {
    fn driver(&self) -> Driver {
        Driver::Postgres
    }

    fn table_name_with_schema(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    async fn migrations(&self, ctx: &Context, limit: usize) -> Result<Vec<Migration>> {
        let query = format!(
            "SELECT version, apply_time FROM {} ORDER BY apply_time DESC, version DESC{}",
            self.table_name_with_schema(),
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
        let query = "SELECT COUNT(*) FROM pg_class c \
                     JOIN pg_namespace n ON n.oid = c.relnamespace \
                     WHERE (c.relname, n.nspname) = ($1, $2)";
        let args = [
            Value::from(self.table.as_str()),
            Value::from(self.schema.as_str()),
        ];
        let count: i64 = self.scalar(ctx, query, &args).await?.get()?;
        Ok(count > 0)
    }

    async fn create_migration_history_table(&self, ctx: &Context) -> Result<()> {
        let query = format!(
            "CREATE TABLE {} (version varchar(180) PRIMARY KEY, apply_time integer)",
            self.table_name_with_schema()
        );
        self.exec(ctx, &query, &[]).await
    }

    async fn drop_migration_history_table(&self, ctx: &Context) -> Result<()> {
        let query = format!("DROP TABLE {}", self.table_name_with_schema());
        self.exec(ctx, &query, &[]).await
    }

    async fn insert_migration(&self, ctx: &Context, version: &str) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (version, apply_time) VALUES ($1, $2)",
            self.table_name_with_schema()
        );
        self.exec(ctx, &query, &[Value::from(version), Value::from(now())])
            .await
    }

    async fn remove_migration(&self, ctx: &Context, version: &str) -> Result<()> {
        let query = format!(
            "DELETE FROM {} WHERE (version) = ($1)",
            self.table_name_with_schema()
        );
        self.exec(ctx, &query, &[Value::from(version)]).await
    }

    async fn migrations_count(&self, ctx: &Context) -> Result<usize> {
        let query = format!("SELECT COUNT(*) FROM {}", self.table_name_with_schema());
        self.scalar(ctx, &query, &[]).await?.get()
    }

    async fn exists_migration(&self, ctx: &Context, version: &str) -> Result<bool> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE version = $1)",
            self.table_name_with_schema()
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

/// Wraps PostgreSQL server errors into [`DbError`]. The internal query
/// reported by the server wins over the one that was sent.
fn translate(err: MigrateError, query: &str) -> MigrateError {
    let MigrateError::Sqlx(sqlx::Error::Database(db)) = &err else {
        return err;
    };
    let Some(pg) = db.try_downcast_ref::<PgDatabaseError>() else {
        return err;
    };
    let code = pg.code().to_string();
    let severity = format!("{:?}", pg.severity()).to_uppercase();
    let message = pg.message().to_string();
    let details = pg.detail().unwrap_or_default().to_string();
    let internal_query = internal_query(pg.position(), query);
    DbError {
        code,
        severity,
        message,
        details,
        internal_query,
        cause: Box::new(err),
    }
    .into()
}

fn internal_query(position: Option<PgErrorPosition<'_>>, sent: &str) -> String {
    match position {
        Some(PgErrorPosition::Internal { query, .. }) => query.to_string(),
        _ => sent.to_string(),
    }
}
