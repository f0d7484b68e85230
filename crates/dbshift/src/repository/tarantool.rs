//! Tarantool history space.
//!
//! Every operation is a Lua snippet sent through EVAL; arguments arrive in
//! the snippet as `...`. The space keeps `(version, apply_time)` tuples with
//! a primary index on `version` and a secondary `apply_time` index used for
//! newest-first listings.

use std::sync::Arc;

use async_trait::async_trait;

use super::{collect_migrations, now, Migration, Repository};
use crate::conn::{Conn, TxFn};
use crate::context::Context;
use crate::dsn::Driver;
use crate::error::{DbError, MigrateError, Result};
use crate::value::Value;

/// History space on Tarantool.
pub struct TarantoolRepository {
    conn: Arc<Conn>,
    space: String,
}

impl TarantoolRepository {
    /// Creates the repository. The space name must already be validated.
    pub(crate) fn new(conn: Arc<Conn>, space: String) -> Self {
        Self { conn, space }
    }

    /// Snippets issued by `create_migration_history_table`, in order.
    #[must_use]
    pub fn create_statements(&self) -> Vec<String> {
        let space = &self.space;
        vec![
            format!("box.schema.space.create('{space}', {{if_not_exists=true}})"),
            format!(
                "box.space.{space}:format({{{{name='version', type='string'}}, {{name='apply_time', type='unsigned'}}}})"
            ),
            format!(
                "box.space.{space}:create_index('primary', {{type='TREE', parts={{'version'}}, if_not_exists=true}})"
            ),
            format!(
                "box.space.{space}:create_index('apply_time', {{type='TREE', parts={{'apply_time', 'version'}}, if_not_exists=true}})"
            ),
        ]
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
impl Repository for TarantoolRepository {
    fn driver(&self) -> Driver {
        Driver::Tarantool
    }

    fn table_name_with_schema(&self) -> String {
        self.space.clone()
    }

    async fn migrations(&self, ctx: &Context, limit: usize) -> Result<Vec<Migration>> {
        let options = if limit == 0 {
            "{iterator='LT'}".to_string()
        } else {
            format!("{{iterator='LT', limit={limit}}}")
        };
        let query = format!(
            "return box.space.{}.index.apply_time:select({{}}, {options})",
            self.space
        );
        let rows = self
            .conn
            .query(ctx, &query, &[])
            .await
            .map_err(|err| translate(err, &query))?;
        collect_migrations(rows)
    }

    async fn has_migration_history_table(&self, ctx: &Context) -> Result<bool> {
        let query = format!("return box.space.{} ~= nil", self.space);
        self.scalar(ctx, &query, &[]).await?.get()
    }

    async fn create_migration_history_table(&self, ctx: &Context) -> Result<()> {
        for statement in self.create_statements() {
            self.exec(ctx, &statement, &[]).await?;
        }
        Ok(())
    }

    async fn drop_migration_history_table(&self, ctx: &Context) -> Result<()> {
        let query = format!("box.space.{}:drop()", self.space);
        self.exec(ctx, &query, &[]).await
    }

    async fn insert_migration(&self, ctx: &Context, version: &str) -> Result<()> {
        let query = format!("box.space.{}:insert{{...}}", self.space);
        self.exec(ctx, &query, &[Value::from(version), Value::from(now())])
            .await
    }

    async fn remove_migration(&self, ctx: &Context, version: &str) -> Result<()> {
        let query = format!("box.space.{}:delete{{...}}", self.space);
        self.exec(ctx, &query, &[Value::from(version)]).await
    }

    async fn migrations_count(&self, ctx: &Context) -> Result<usize> {
        let query = format!("return box.space.{}:len()", self.space);
        self.scalar(ctx, &query, &[]).await?.get()
    }

    async fn exists_migration(&self, ctx: &Context, version: &str) -> Result<bool> {
        let query = format!(
            "return box.space.{}:count(..., {{iterator='EQ'}})",
            self.space
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

/// Wraps Tarantool error responses into [`DbError`].
fn translate(err: MigrateError, query: &str) -> MigrateError {
    let MigrateError::Tarantool(tarantool) = &err else {
        return err;
    };
    DbError {
        code: tarantool.code.to_string(),
        severity: "ERR".to_string(),
        message: tarantool.message.clone(),
        details: String::new(),
        internal_query: query.to_string(),
        cause: Box::new(err),
    }
    .into()
}
