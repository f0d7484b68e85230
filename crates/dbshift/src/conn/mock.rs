//! In-memory backend that records statements.
//!
//! Used by the test suites to drive repositories and the engine without a
//! server. Responses and failures are keyed by a query fragment: the first
//! registered fragment found in the query wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Backend, Transaction};
use crate::context::Context;
use crate::dsn::Driver;
use crate::error::{MigrateError, Result};
use crate::rows::{ExecResult, Rows};
use crate::value::Value;

/// A statement the mock received.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Query text as sent.
    pub query: String,
    /// Bound arguments.
    pub args: Vec<Value>,
    /// Whether it ran inside a committed transaction.
    pub transactional: bool,
}

#[derive(Debug, Default)]
struct State {
    statements: Vec<Statement>,
    responses: Vec<(String, Vec<Value>)>,
    failures: Vec<(String, String)>,
    commit_failure: Option<String>,
    ping_failure: Option<String>,
    pings: usize,
    begins: usize,
    commits: usize,
    rollbacks: usize,
}

impl State {
    fn failure(&self, query: &str) -> Option<MigrateError> {
        self.failures
            .iter()
            .find(|(fragment, _)| query.contains(fragment.as_str()))
            .map(|(_, message)| MigrateError::Driver(message.clone()))
    }

    fn response(&self, query: &str) -> Rows {
        self.responses
            .iter()
            .find(|(fragment, _)| query.contains(fragment.as_str()))
            .map_or_else(Rows::empty, |(_, rows)| Rows::fake(rows.clone()))
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn statement(query: &str, args: &[Value], transactional: bool) -> Statement {
    Statement {
        query: query.to_string(),
        args: args.to_vec(),
        transactional,
    }
}

/// A [`Backend`] that answers from canned responses.
#[derive(Debug)]
pub struct MockBackend {
    driver: Driver,
    state: Arc<Mutex<State>>,
}

impl MockBackend {
    /// Creates a mock that reports itself as `driver`.
    #[must_use]
    pub fn new(driver: Driver) -> Self {
        Self {
            driver,
            state: Arc::default(),
        }
    }

    /// A handle for configuring and inspecting the mock after it has been
    /// moved into a [`super::Conn`].
    #[must_use]
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn driver(&self) -> Driver {
        self.driver
    }

    async fn ping(&self, _ctx: &Context) -> Result<()> {
        let mut state = lock(&self.state);
        state.pings += 1;
        match &state.ping_failure {
            Some(message) => Err(MigrateError::Driver(message.clone())),
            None => Ok(()),
        }
    }

    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Rows> {
        ctx.check()?;
        let mut state = lock(&self.state);
        if let Some(err) = state.failure(query) {
            return Err(err);
        }
        state.statements.push(statement(query, args, false));
        Ok(state.response(query))
    }

    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        ctx.check()?;
        let mut state = lock(&self.state);
        if let Some(err) = state.failure(query) {
            return Err(err);
        }
        state.statements.push(statement(query, args, false));
        Ok(ExecResult::new(None, Some(0)))
    }

    async fn begin(&self, ctx: &Context) -> Result<Arc<dyn Transaction>> {
        ctx.check()?;
        lock(&self.state).begins += 1;
        Ok(Arc::new(MockTransaction {
            state: Arc::clone(&self.state),
            buffer: Mutex::default(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Transaction of a [`MockBackend`]; statements become visible on commit.
#[derive(Debug)]
pub struct MockTransaction {
    state: Arc<Mutex<State>>,
    buffer: Mutex<Vec<Statement>>,
    closed: AtomicBool,
}

impl MockTransaction {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MigrateError::TransactionAlreadyClosed);
        }
        Ok(())
    }

    fn buffer(&self) -> MutexGuard<'_, Vec<Statement>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Rows> {
        ctx.check()?;
        self.ensure_open()?;
        let state = lock(&self.state);
        if let Some(err) = state.failure(query) {
            return Err(err);
        }
        self.buffer().push(statement(query, args, true));
        Ok(state.response(query))
    }

    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        ctx.check()?;
        self.ensure_open()?;
        if let Some(err) = lock(&self.state).failure(query) {
            return Err(err);
        }
        self.buffer().push(statement(query, args, true));
        Ok(ExecResult::new(None, Some(0)))
    }

    async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        if let Some(message) = &state.commit_failure {
            return Err(MigrateError::Driver(message.clone()));
        }
        self.closed.store(true, Ordering::Release);
        let buffered = std::mem::take(&mut *self.buffer());
        state.statements.extend(buffered);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        self.closed.store(true, Ordering::Release);
        self.buffer().clear();
        lock(&self.state).rollbacks += 1;
        Ok(())
    }
}

/// Configures and inspects a [`MockBackend`].
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<State>>,
}

impl MockHandle {
    /// Answers queries containing `fragment` with `rows` (see
    /// [`Rows::fake`]).
    pub fn respond(&self, fragment: &str, rows: Vec<Value>) {
        lock(&self.state)
            .responses
            .push((fragment.to_string(), rows));
    }

    /// Fails statements containing `fragment` with a driver error.
    pub fn fail(&self, fragment: &str, message: &str) {
        lock(&self.state)
            .failures
            .push((fragment.to_string(), message.to_string()));
    }

    /// Makes every commit fail.
    pub fn fail_commit(&self, message: &str) {
        lock(&self.state).commit_failure = Some(message.to_string());
    }

    /// Makes every ping fail.
    pub fn fail_ping(&self, message: &str) {
        lock(&self.state).ping_failure = Some(message.to_string());
    }

    /// Statements that took effect, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<Statement> {
        lock(&self.state).statements.clone()
    }

    /// Query texts of [`MockHandle::statements`].
    #[must_use]
    pub fn queries(&self) -> Vec<String> {
        lock(&self.state)
            .statements
            .iter()
            .map(|s| s.query.clone())
            .collect()
    }

    /// Forgets recorded statements.
    pub fn clear(&self) {
        lock(&self.state).statements.clear();
    }

    /// Number of pings received.
    #[must_use]
    pub fn pings(&self) -> usize {
        lock(&self.state).pings
    }

    /// Number of transactions begun.
    #[must_use]
    pub fn begins(&self) -> usize {
        lock(&self.state).begins
    }

    /// Number of commits.
    #[must_use]
    pub fn commits(&self) -> usize {
        lock(&self.state).commits
    }

    /// Number of rollbacks.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        lock(&self.state).rollbacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_respond_by_fragment() {
        let backend = MockBackend::new(Driver::Postgres);
        let handle = backend.handle();
        handle.respond("COUNT", vec![Value::Int(3)]);

        let ctx = Context::new();
        let rows = backend
            .query(&ctx, "SELECT COUNT(*) FROM t", &[])
            .await
            .unwrap();
        assert_eq!(rows.scalar().unwrap(), Value::Int(3));

        let rows = backend.query(&ctx, "SELECT 1", &[]).await.unwrap();
        assert_eq!(rows.remaining(), 0);
        assert_eq!(handle.queries().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_not_recorded() {
        let backend = MockBackend::new(Driver::MySql);
        let handle = backend.handle();
        handle.fail("DROP", "denied");

        let err = backend
            .exec(&Context::new(), "DROP TABLE t", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Driver(ref m) if m == "denied"));
        assert!(handle.statements().is_empty());
    }

    #[tokio::test]
    async fn test_closed_transaction() {
        let backend = MockBackend::new(Driver::Postgres);
        let ctx = Context::new();
        let tx = backend.begin(&ctx).await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(
            tx.exec(&ctx, "SELECT 1", &[]).await,
            Err(MigrateError::TransactionAlreadyClosed)
        ));
        assert!(matches!(
            tx.rollback().await,
            Err(MigrateError::TransactionAlreadyClosed)
        ));
    }
}
