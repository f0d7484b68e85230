//! Shared test fixtures.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use dbshift::conn::mock::{MockBackend, MockHandle};
use dbshift::prelude::*;

/// A history table kept in memory. Script statements go through a
/// [`MockBackend`] so tests can inspect what ran and inject failures.
pub struct MemoryRepository {
    conn: Conn,
    history: Mutex<Vec<Migration>>,
    has_table: AtomicBool,
    clock: AtomicI64,
    force_safely: bool,
}

impl MemoryRepository {
    pub fn new(driver: Driver) -> (Arc<Self>, MockHandle) {
        Self::build(driver, false)
    }

    /// A repository that runs every script in a transaction.
    pub fn forcing_safe_mode(driver: Driver) -> (Arc<Self>, MockHandle) {
        Self::build(driver, true)
    }

    fn build(driver: Driver, force_safely: bool) -> (Arc<Self>, MockHandle) {
        let backend = MockBackend::new(driver);
        let handle = backend.handle();
        let dsn = Dsn::parse(&format!("{}://u:p@localhost/db", driver.short_name())).unwrap();
        let repo = Self {
            conn: Conn::with_backend(dsn, Box::new(backend)),
            history: Mutex::new(Vec::new()),
            has_table: AtomicBool::new(false),
            clock: AtomicI64::new(1_616_969_760),
            force_safely,
        };
        (Arc::new(repo), handle)
    }

    /// Marks `versions` as applied, oldest first.
    pub fn seed(&self, versions: &[&str]) {
        self.has_table.store(true, Ordering::SeqCst);
        for version in versions {
            self.record(version);
        }
    }

    /// Applied versions, oldest first.
    pub fn versions(&self) -> Vec<String> {
        let mut history = self.history.lock().unwrap().clone();
        history.sort_by(|a, b| (a.apply_time, &a.version).cmp(&(b.apply_time, &b.version)));
        history.into_iter().map(|m| m.version).collect()
    }

    pub fn apply_time(&self, version: &str) -> Option<i64> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.version == version)
            .map(|m| m.apply_time)
    }

    pub fn has_table(&self) -> bool {
        self.has_table.load(Ordering::SeqCst)
    }

    fn record(&self, version: &str) {
        let apply_time = self.clock.fetch_add(1, Ordering::SeqCst);
        self.history.lock().unwrap().push(Migration {
            version: version.to_string(),
            apply_time,
        });
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn driver(&self) -> Driver {
        self.conn.driver()
    }

    fn table_name_with_schema(&self) -> String {
        "memory.migration".to_string()
    }

    fn force_safely(&self) -> bool {
        self.force_safely
    }

    async fn migrations(&self, _ctx: &Context, limit: usize) -> Result<Vec<Migration>> {
        let mut history = self.history.lock().unwrap().clone();
        history.sort_by(|a, b| (b.apply_time, &b.version).cmp(&(a.apply_time, &a.version)));
        if limit > 0 {
            history.truncate(limit);
        }
        Ok(history)
    }

    async fn has_migration_history_table(&self, _ctx: &Context) -> Result<bool> {
        Ok(self.has_table())
    }

    async fn create_migration_history_table(&self, _ctx: &Context) -> Result<()> {
        self.has_table.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn drop_migration_history_table(&self, _ctx: &Context) -> Result<()> {
        self.has_table.store(false, Ordering::SeqCst);
        self.history.lock().unwrap().clear();
        Ok(())
    }

    async fn insert_migration(&self, ctx: &Context, version: &str) -> Result<()> {
        ctx.check()?;
        self.record(version);
        Ok(())
    }

    async fn remove_migration(&self, ctx: &Context, version: &str) -> Result<()> {
        ctx.check()?;
        self.history.lock().unwrap().retain(|m| m.version != version);
        Ok(())
    }

    async fn migrations_count(&self, _ctx: &Context) -> Result<usize> {
        Ok(self.history.lock().unwrap().len())
    }

    async fn exists_migration(&self, _ctx: &Context, version: &str) -> Result<bool> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.version == version))
    }

    async fn exec_query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<()> {
        self.conn.exec(ctx, query, args).await.map(|_| ())
    }

    async fn query_scalar(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Value> {
        self.conn.query(ctx, query, args).await?.scalar()
    }

    async fn exec_query_transaction<'a>(&'a self, ctx: &'a Context, f: TxFn<'a>) -> Result<()> {
        self.conn.transaction(ctx, f).await
    }
}

/// A temporary migration directory.
pub fn migration_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    write_files(dir.path(), files);
    dir
}

pub fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (name, body) in files {
        fs::write(dir.join(name), body).unwrap();
    }
}
