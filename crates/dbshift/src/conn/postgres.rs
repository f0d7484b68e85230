//! PostgreSQL backend over a `sqlx` pool.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Executor, Postgres, Row, TypeInfo};
use tokio::sync::Mutex;

use super::{Backend, Transaction};
use crate::context::Context;
use crate::dsn::{Driver, Dsn};
use crate::error::{MigrateError, Result};
use crate::rows::{ExecResult, Rows};
use crate::value::Value;

const MAX_CONNECTIONS: u32 = 4;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// PostgreSQL connection pool.
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Builds a lazy pool for the DSN's first host.
    pub fn open(dsn: &Dsn) -> Result<Self> {
        let options = PgConnectOptions::from_str(&dsn.url_for_host("postgres", dsn.primary()))?;
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(options);
        Ok(Self { pool })
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    fn driver(&self) -> Driver {
        Driver::Postgres
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        ctx.run(async {
            let mut conn = self.pool.acquire().await?;
            conn.ping().await?;
            Ok(())
        })
        .await
    }

    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Rows> {
        ctx.run(fetch(&self.pool, query, args)).await
    }

    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        ctx.run(execute(&self.pool, query, args)).await
    }

    async fn begin(&self, ctx: &Context) -> Result<Arc<dyn Transaction>> {
        let tx = ctx.run(async { Ok(self.pool.begin().await?) }).await?;
        Ok(Arc::new(PostgresTransaction {
            inner: Mutex::new(Some(tx)),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// An open PostgreSQL transaction.
pub struct PostgresTransaction {
    inner: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Rows> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(MigrateError::TransactionAlreadyClosed)?;
        ctx.run(fetch(&mut **tx, query, args)).await
    }

    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(MigrateError::TransactionAlreadyClosed)?;
        ctx.run(execute(&mut **tx, query, args)).await
    }

    async fn commit(&self) -> Result<()> {
        let tx = self
            .inner
            .lock()
            .await
            .take()
            .ok_or(MigrateError::TransactionAlreadyClosed)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let tx = self
            .inner
            .lock()
            .await
            .take()
            .ok_or(MigrateError::TransactionAlreadyClosed)?;
        tx.rollback().await?;
        Ok(())
    }
}

async fn execute<'e, E>(executor: E, query: &'e str, args: &[Value]) -> Result<ExecResult>
where
    E: Executor<'e, Database = Postgres>,
{
    // Without arguments the simple protocol is used, so a statement may
    // carry several commands.
    let done = if args.is_empty() {
        executor.execute(sqlx::raw_sql(query)).await?
    } else {
        executor
            .execute(bind_all(sqlx::query(query), args)?)
            .await?
    };
    Ok(ExecResult::new(None, Some(done.rows_affected())))
}

async fn fetch<'e, E>(executor: E, query: &'e str, args: &[Value]) -> Result<Rows>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows = bind_all(sqlx::query(query), args)?
        .fetch_all(executor)
        .await?;
    decode_rows(&rows)
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    args: &[Value],
) -> Result<Query<'q, Postgres, PgArguments>> {
    for arg in args {
        query = match arg {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::UInt(v) => query.bind(i64::try_from(*v).map_err(|_| {
                MigrateError::Bind(format!("{v} does not fit a PostgreSQL bigint"))
            })?),
            Value::Float(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.clone()),
            Value::Bytes(v) => query.bind(v.clone()),
            Value::Time(v) => query.bind(*v),
            Value::Tuple(_) => {
                return Err(MigrateError::Bind(
                    "tuples cannot be bound as PostgreSQL parameters".into(),
                ))
            }
        };
    }
    Ok(query)
}

fn decode_rows(rows: &[PgRow]) -> Result<Rows> {
    let columns = rows.first().map_or_else(Vec::new, |row| {
        row.columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    });
    let decoded = rows
        .iter()
        .map(decode_row)
        .collect::<Result<Vec<_>>>()?;
    Ok(Rows::new(columns, decoded))
}

fn decode_row(row: &PgRow) -> Result<Vec<Value>> {
    row.columns()
        .iter()
        .map(|column| -> Result<Value> {
            let i = column.ordinal();
            let value: Value = match column.type_info().name() {
                "BOOL" => row.try_get::<Option<bool>, _>(i)?.into(),
                "INT2" => row.try_get::<Option<i16>, _>(i)?.into(),
                "INT4" => row.try_get::<Option<i32>, _>(i)?.into(),
                "INT8" => row.try_get::<Option<i64>, _>(i)?.into(),
                "FLOAT4" => row.try_get::<Option<f32>, _>(i)?.into(),
                "FLOAT8" => row.try_get::<Option<f64>, _>(i)?.into(),
                "TIMESTAMPTZ" => row.try_get::<Option<DateTime<Utc>>, _>(i)?.into(),
                "TIMESTAMP" => row
                    .try_get::<Option<NaiveDateTime>, _>(i)?
                    .map(|t| t.and_utc())
                    .into(),
                "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(i)?.into(),
                _ => row.try_get::<Option<String>, _>(i)?.into(),
            };
            Ok(value)
        })
        .collect()
}
