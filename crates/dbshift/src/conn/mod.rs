//! Connections.
//!
//! [`Conn`] wraps one [`Backend`] per DSN and adds what every driver shares:
//! memoised pinging, retries at connect time, routing of `exec`/`query`
//! through the transaction carried by the [`Context`], and the
//! begin/commit/rollback discipline of [`Conn::transaction`].
//!
//! - **PostgreSQL / MySQL**: `sqlx` pools (`postgres.rs`, `mysql.rs`)
//! - **ClickHouse**: HTTP interface (`clickhouse.rs`)
//! - **Tarantool**: IPROTO over TCP (`tarantool.rs`)
//! - **Mock**: in-memory recorder for tests (`mock.rs`)

pub mod clickhouse;
pub mod mock;
pub mod mysql;
pub mod postgres;
pub mod tarantool;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::context::Context;
use crate::dsn::{Driver, Dsn};
use crate::error::{MigrateError, Result};
use crate::rows::{ExecResult, Rows};
use crate::value::Value;

/// Delay between connection attempts in [`Conn::try_connect`].
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Body of a transaction. It receives the derived context that carries the
/// transaction and may borrow anything that outlives `'a`.
pub type TxFn<'a> = Box<dyn FnOnce(Context) -> BoxFuture<'a, Result<()>> + Send + 'a>;

/// Boxes an async closure into a [`TxFn`].
pub fn tx_fn<'a, F, Fut>(f: F) -> TxFn<'a>
where
    F: FnOnce(Context) -> Fut + Send + 'a,
    Fut: Future<Output = Result<()>> + Send + 'a,
{
    Box::new(move |ctx| -> BoxFuture<'a, Result<()>> { Box::pin(f(ctx)) })
}

/// A driver-specific connection.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The driver this backend speaks.
    fn driver(&self) -> Driver;

    /// Checks the server is reachable.
    async fn ping(&self, ctx: &Context) -> Result<()>;

    /// Runs a statement that returns rows.
    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Rows>;

    /// Runs a statement that returns no rows.
    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult>;

    /// Opens a transaction.
    async fn begin(&self, ctx: &Context) -> Result<Arc<dyn Transaction>>;

    /// Releases the underlying connections.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// An open transaction. After `commit` or `rollback` every call fails with
/// [`MigrateError::TransactionAlreadyClosed`].
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Runs a statement that returns rows inside the transaction.
    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Rows>;

    /// Runs a statement that returns no rows inside the transaction.
    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult>;

    /// Commits.
    async fn commit(&self) -> Result<()>;

    /// Rolls back.
    async fn rollback(&self) -> Result<()>;
}

/// A connection to one migration target.
pub struct Conn {
    dsn: Dsn,
    backend: Box<dyn Backend>,
    pinged: AtomicBool,
}

impl Conn {
    /// Parses the DSN and opens the matching backend. Backends connect
    /// lazily; use [`Conn::ping`] or [`Conn::try_connect`] to verify.
    pub fn new(raw: &str) -> Result<Self> {
        let dsn = Dsn::parse(raw)?;
        let backend: Box<dyn Backend> = match dsn.driver {
            Driver::Postgres => Box::new(postgres::PostgresBackend::open(&dsn)?),
            Driver::MySql => Box::new(mysql::MySqlBackend::open(&dsn)?),
            Driver::ClickHouse => Box::new(clickhouse::ClickHouseBackend::open(&dsn)?),
            Driver::Tarantool => Box::new(tarantool::TarantoolBackend::open(&dsn)?),
        };
        Ok(Self::with_backend(dsn, backend))
    }

    /// Wraps an already constructed backend.
    #[must_use]
    pub fn with_backend(dsn: Dsn, backend: Box<dyn Backend>) -> Self {
        Self {
            dsn,
            backend,
            pinged: AtomicBool::new(false),
        }
    }

    /// Opens and pings, retrying up to `max_attempts` times with
    /// [`RETRY_DELAY`] between attempts. Values below 1 mean one attempt.
    pub async fn try_connect(raw: &str, max_attempts: i32) -> Result<Self> {
        retry(max_attempts, RETRY_DELAY, || async move {
            let conn = Self::new(raw)?;
            conn.ping(&Context::new()).await?;
            Ok(conn)
        })
        .await
    }

    /// The driver behind this connection.
    #[must_use]
    pub fn driver(&self) -> Driver {
        self.backend.driver()
    }

    /// The DSN this connection was opened with.
    #[must_use]
    pub fn dsn(&self) -> &Dsn {
        &self.dsn
    }

    /// Pings the server. Once a ping succeeds, later calls return
    /// immediately.
    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        if self.pinged.load(Ordering::Acquire) {
            return Ok(());
        }
        self.backend.ping(ctx).await?;
        self.pinged.store(true, Ordering::Release);
        Ok(())
    }

    /// Runs a statement that returns rows, inside the context's
    /// transaction when there is one.
    pub async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Rows> {
        ctx.check()?;
        debug!(driver = %self.driver(), query = %query, "query");
        match ctx.transaction() {
            Some(tx) => tx.query(ctx, query, args).await,
            None => self.backend.query(ctx, query, args).await,
        }
    }

    /// Runs a statement that returns no rows, inside the context's
    /// transaction when there is one.
    pub async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        ctx.check()?;
        debug!(driver = %self.driver(), query = %query, "exec");
        match ctx.transaction() {
            Some(tx) => tx.exec(ctx, query, args).await,
            None => self.backend.exec(ctx, query, args).await,
        }
    }

    /// Runs `f` inside a new transaction.
    ///
    /// `f` gets a derived context carrying the transaction. An error from
    /// `f` rolls back and is returned; success commits, and a failed commit
    /// rolls back and returns [`MigrateError::Commit`]. A context that
    /// already carries a transaction fails with
    /// [`MigrateError::TransactionAlreadyOpened`] before anything begins.
    pub async fn transaction<'a>(&'a self, ctx: &'a Context, f: TxFn<'a>) -> Result<()> {
        if ctx.in_transaction() {
            return Err(MigrateError::TransactionAlreadyOpened);
        }
        ctx.check()?;

        let tx = self.backend.begin(ctx).await?;
        let tx_ctx = ctx.with_transaction(Arc::clone(&tx));

        if let Err(err) = f(tx_ctx).await {
            debug!(error = %err, "rolling back transaction");
            return match tx.rollback().await {
                Ok(()) => Err(err),
                Err(rollback) => Err(MigrateError::Rollback {
                    source: Box::new(err),
                    rollback: Box::new(rollback),
                }),
            };
        }

        if let Err(commit) = tx.commit().await {
            if let Err(rollback) = tx.rollback().await {
                debug!(error = %rollback, "rollback after failed commit");
            }
            return Err(MigrateError::Commit {
                source: Box::new(commit),
            });
        }
        Ok(())
    }

    /// Closes the backend.
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}

/// Calls `op` until it succeeds or `max_attempts` (at least 1) is reached,
/// sleeping `delay` between attempts. Returns the last error.
pub async fn retry<T, F, Fut>(max_attempts: i32, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => return Err(err),
            Err(err) => {
                warn!(attempt, max_attempts, error = %err, "connection attempt failed");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
