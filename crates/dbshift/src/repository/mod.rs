//! Migration history repositories.
//!
//! A [`Repository`] owns the history table of one backend and runs
//! statements on behalf of the engine. There is one implementation per
//! driver; [`factory::create`] validates identifiers and picks the right one.

pub mod clickhouse;
pub mod factory;
pub mod mysql;
pub mod postgres;
pub mod tarantool;

use async_trait::async_trait;
use chrono::Utc;

use crate::conn::TxFn;
use crate::context::Context;
use crate::dsn::Driver;
use crate::error::Result;
use crate::rows::Rows;
use crate::value::{FromValue, Value};

pub use factory::create;

/// Table name used when none is configured.
pub const DEFAULT_TABLE_NAME: &str = "migration";

/// A row of the history table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Migration version, e.g. `210328_221600_create_users`.
    pub version: String,
    /// When it was applied, in unix seconds.
    pub apply_time: i64,
}

/// Options shared by every repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryOptions {
    /// History table, optionally `schema.table`.
    pub table_name: String,
    /// ClickHouse cluster for `ON CLUSTER` DDL.
    pub cluster_name: String,
    /// Whether the ClickHouse history table is replicated.
    pub replicated: bool,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            cluster_name: String::new(),
            replicated: false,
        }
    }
}

/// Operations the migration engine needs from a backend.
#[async_trait]
pub trait Repository: Send + Sync {
    /// The backend this repository talks to.
    fn driver(&self) -> Driver;

    /// Fully qualified history table name.
    fn table_name_with_schema(&self) -> String;

    /// Whether every migration must run inside [`Repository::exec_query_transaction`]
    /// regardless of its file name.
    fn force_safely(&self) -> bool {
        false
    }

    /// Applied migrations, newest first. `limit == 0` returns all of them.
    async fn migrations(&self, ctx: &Context, limit: usize) -> Result<Vec<Migration>>;

    /// Whether the history table exists.
    async fn has_migration_history_table(&self, ctx: &Context) -> Result<bool>;

    /// Creates the history table.
    async fn create_migration_history_table(&self, ctx: &Context) -> Result<()>;

    /// Drops the history table.
    async fn drop_migration_history_table(&self, ctx: &Context) -> Result<()>;

    /// Records `version` as applied now.
    async fn insert_migration(&self, ctx: &Context, version: &str) -> Result<()>;

    /// Forgets `version`.
    async fn remove_migration(&self, ctx: &Context, version: &str) -> Result<()>;

    /// Number of applied migrations.
    async fn migrations_count(&self, ctx: &Context) -> Result<usize>;

    /// Whether `version` is applied.
    async fn exists_migration(&self, ctx: &Context, version: &str) -> Result<bool>;

    /// Runs one statement of a migration script.
    async fn exec_query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<()>;

    /// Runs a query and returns the first column of its first row.
    async fn query_scalar(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Value>;

    /// Runs `f` inside a backend transaction.
    async fn exec_query_transaction<'a>(&'a self, ctx: &'a Context, f: TxFn<'a>) -> Result<()>;
}

impl dyn Repository + '_ {
    /// [`Repository::query_scalar`] converted into a scalar destination.
    pub async fn query_scalar_as<T: FromValue>(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<T> {
        self.query_scalar(ctx, query, args).await?.get()
    }
}

/// Current time in unix seconds, as stored in `apply_time`.
pub(crate) fn now() -> i64 {
    Utc::now().timestamp()
}

/// Reads `(version, apply_time)` rows.
pub(crate) fn collect_migrations(rows: Rows) -> Result<Vec<Migration>> {
    Ok(rows
        .collect_all::<(String, i64)>()?
        .into_iter()
        .map(|(version, apply_time)| Migration {
            version,
            apply_time,
        })
        .collect())
}

/// `LIMIT` clause for a listing; empty when unlimited.
pub(crate) fn limit_clause(limit: usize) -> String {
    if limit == 0 {
        String::new()
    } else {
        format!(" LIMIT {limit}")
    }
}
