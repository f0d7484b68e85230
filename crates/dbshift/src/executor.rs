//! Migration engine.
//!
//! Plans which scripts to run by diffing the migration directory against the
//! history table, then runs them strictly in order. A failure stops the run
//! and reports how many migrations had completed; nothing already applied is
//! undone.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};

use crate::conn::tx_fn;
use crate::context::Context;
use crate::error::{MigrateError, Result};
use crate::files::{new_file_names, validate_version, Direction, MigrationFile, MigrationFiles};
use crate::prompt::Prompter;
use crate::repository::{Migration, Repository};
use crate::scanner::clean_sql;

/// Rows shown by `history` when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// How many migrations an operation may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Limit {
    /// No limit.
    #[default]
    All,
    /// At most this many (never zero).
    Count(usize),
}

impl Limit {
    /// Parses an optional argument, falling back to `default` when absent.
    pub fn parse_or(arg: Option<&str>, default: Self) -> Result<Self> {
        arg.map_or(Ok(default), str::parse)
    }

    /// The limit as the repositories take it: `0` means all.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        match self {
            Self::All => 0,
            Self::Count(n) => n,
        }
    }

    fn truncate<T>(self, items: &mut Vec<T>) {
        if let Self::Count(n) = self {
            items.truncate(n);
        }
    }
}

impl FromStr for Limit {
    type Err = MigrateError;

    /// `""` and `all` mean no limit; otherwise a positive integer.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        match s.parse::<usize>() {
            Ok(n) if n > 0 => Ok(Self::Count(n)),
            _ => Err(MigrateError::InvalidLimit(s.to_string())),
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Count(n) => write!(f, "{n}"),
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    /// Versions reverted, in execution order.
    pub reverted: Vec<String>,
    /// Versions applied, in execution order.
    pub applied: Vec<String>,
    /// The operator declined the plan.
    pub declined: bool,
}

impl Summary {
    /// Whether nothing ran.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reverted.is_empty() && self.applied.is_empty()
    }
}

/// Runs file-driven migrations against one repository.
pub struct Executor {
    repo: Arc<dyn Repository>,
    dir: PathBuf,
    compact: bool,
    prompter: Option<Arc<dyn Prompter>>,
}

impl Executor {
    /// Creates an executor for the scripts in `dir`.
    pub fn new(repo: Arc<dyn Repository>, dir: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            dir: dir.into(),
            compact: false,
            prompter: None,
        }
    }

    /// Suppresses per-statement log lines.
    #[must_use]
    pub fn compact(mut self, enabled: bool) -> Self {
        self.compact = enabled;
        self
    }

    /// Asks `prompter` before running any plan or creating files.
    #[must_use]
    pub fn interactive(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// The repository migrations are recorded in.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// The migration directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the history table unless it exists.
    pub async fn ensure_history_table(&self, ctx: &Context) -> Result<()> {
        if !self.repo.has_migration_history_table(ctx).await? {
            info!(table = %self.repo.table_name_with_schema(), "Creating migration history table");
            self.repo.create_migration_history_table(ctx).await?;
        }
        Ok(())
    }

    async fn applied(&self, ctx: &Context, limit: Limit) -> Result<Vec<Migration>> {
        if !self.repo.has_migration_history_table(ctx).await? {
            return Ok(Vec::new());
        }
        self.repo.migrations(ctx, limit.as_usize()).await
    }

    fn pending(files: &MigrationFiles, applied: &[Migration]) -> Vec<MigrationFile> {
        let applied: HashSet<&str> = applied.iter().map(|m| m.version.as_str()).collect();
        files
            .ups()
            .filter(|file| !applied.contains(file.version.as_str()))
            .cloned()
            .collect()
    }

    /// Scripts for `migrations` in `direction`, in the given order. Every
    /// script must exist before anything runs.
    fn scripts<'m>(
        files: &MigrationFiles,
        migrations: impl IntoIterator<Item = &'m Migration>,
        direction: Direction,
    ) -> Result<Vec<MigrationFile>> {
        migrations
            .into_iter()
            .map(|m| {
                files
                    .get(&m.version, direction)
                    .cloned()
                    .ok_or_else(|| MigrateError::MigrationNotFound(m.version.clone()))
            })
            .collect()
    }

    /// Applies pending migrations in ascending version order.
    pub async fn up(&self, ctx: &Context, limit: Limit) -> Result<Summary> {
        self.ensure_history_table(ctx).await?;
        let applied = self.repo.migrations(ctx, 0).await?;
        let files = MigrationFiles::scan(&self.dir)?;
        let mut pending = Self::pending(&files, &applied);
        limit.truncate(&mut pending);

        if pending.is_empty() {
            info!("No new migrations found");
            return Ok(Summary::default());
        }
        self.run(ctx, "apply", pending, Vec::new()).await
    }

    /// Reverts the newest applied migrations.
    pub async fn down(&self, ctx: &Context, limit: Limit) -> Result<Summary> {
        let applied = self.applied(ctx, limit).await?;
        if applied.is_empty() {
            info!("No applied migrations to revert");
            return Ok(Summary::default());
        }
        let files = MigrationFiles::scan(&self.dir)?;
        let downs = Self::scripts(&files, &applied, Direction::Down)?;
        self.run(ctx, "revert", Vec::new(), downs).await
    }

    /// Reverts the newest applied migrations, then applies them again
    /// oldest first.
    pub async fn redo(&self, ctx: &Context, limit: Limit) -> Result<Summary> {
        let applied = self.applied(ctx, limit).await?;
        if applied.is_empty() {
            info!("No applied migrations to redo");
            return Ok(Summary::default());
        }
        let files = MigrationFiles::scan(&self.dir)?;
        let downs = Self::scripts(&files, &applied, Direction::Down)?;
        let ups = Self::scripts(&files, applied.iter().rev(), Direction::Up)?;
        self.run(ctx, "redo", ups, downs).await
    }

    /// Moves the schema to `version`: reverts everything applied after it
    /// when it is applied, otherwise applies every pending migration up to
    /// and including it.
    pub async fn to(&self, ctx: &Context, version: &str) -> Result<Summary> {
        validate_version(version)?;
        self.ensure_history_table(ctx).await?;
        let applied = self.repo.migrations(ctx, 0).await?;
        let files = MigrationFiles::scan(&self.dir)?;

        if applied.iter().any(|m| m.version == version) {
            let newer: Vec<Migration> = applied
                .into_iter()
                .take_while(|m| m.version != version)
                .collect();
            if newer.is_empty() {
                info!(version, "Already at version");
                return Ok(Summary::default());
            }
            let downs = Self::scripts(&files, &newer, Direction::Down)?;
            return self.run(ctx, "revert", Vec::new(), downs).await;
        }

        if files.get(version, Direction::Up).is_none() {
            return Err(MigrateError::MigrationNotFound(version.to_string()));
        }
        let ups: Vec<MigrationFile> = Self::pending(&files, &applied)
            .into_iter()
            .filter(|file| file.version.as_str() <= version)
            .collect();
        self.run(ctx, "apply", ups, Vec::new()).await
    }

    /// Applied migrations, newest first.
    pub async fn history(&self, ctx: &Context, limit: Limit) -> Result<Vec<Migration>> {
        self.applied(ctx, limit).await
    }

    /// Migrations on disk that are not applied yet, oldest first.
    pub async fn history_new(&self, ctx: &Context, limit: Limit) -> Result<Vec<MigrationFile>> {
        let applied = self.applied(ctx, Limit::All).await?;
        let files = MigrationFiles::scan(&self.dir)?;
        let mut pending = Self::pending(&files, &applied);
        limit.truncate(&mut pending);
        Ok(pending)
    }

    /// Writes an empty `.safe` up/down pair for `name`. Returns `None`
    /// when the operator declines.
    pub fn create(&self, name: &str) -> Result<Option<(PathBuf, PathBuf)>> {
        create(&self.dir, name, self.prompter.as_deref())
    }

    /// Confirms and runs the downs, then the ups.
    async fn run(
        &self,
        ctx: &Context,
        verb: &str,
        ups: Vec<MigrationFile>,
        downs: Vec<MigrationFile>,
    ) -> Result<Summary> {
        if ups.is_empty() && downs.is_empty() {
            return Ok(Summary::default());
        }
        if !self.confirm(verb, &ups, &downs)? {
            info!("Cancelled");
            return Ok(Summary {
                declined: true,
                ..Summary::default()
            });
        }

        let total = ups.len() + downs.len();
        let mut summary = Summary::default();
        for (done, file) in downs.iter().chain(&ups).enumerate() {
            self.execute(ctx, file)
                .await
                .map_err(|source| MigrateError::MigrationFailed {
                    version: file.version.clone(),
                    done,
                    total,
                    source: Box::new(source),
                })?;
            match file.direction {
                Direction::Up => summary.applied.push(file.version.clone()),
                Direction::Down => summary.reverted.push(file.version.clone()),
            }
        }
        Ok(summary)
    }

    fn confirm(&self, verb: &str, ups: &[MigrationFile], downs: &[MigrationFile]) -> Result<bool> {
        let Some(prompter) = &self.prompter else {
            return Ok(true);
        };
        let lines: Vec<String> = downs
            .iter()
            .map(|file| format!("  - {}", file.version))
            .chain(ups.iter().map(|file| format!("  + {}", file.version)))
            .collect();
        let message = format!(
            "{} {} migration(s):\n{}\nContinue?",
            capitalize(verb),
            ups.len().max(downs.len()),
            lines.join("\n")
        );
        prompter.confirm(&message)
    }

    /// Runs one script, then records it in the history table.
    async fn execute(&self, ctx: &Context, file: &MigrationFile) -> Result<()> {
        let started = Instant::now();
        let direction = file.direction;
        let safely = file.safely || self.repo.force_safely();
        info!(version = %file.version, %direction, safely, "Migrating");

        let statements = file.statements()?;
        run_statements(self.repo.as_ref(), ctx, statements, safely, self.compact).await?;

        match direction {
            Direction::Up => self.repo.insert_migration(ctx, &file.version).await?,
            Direction::Down => self.repo.remove_migration(ctx, &file.version).await?,
        }
        info!(
            version = %file.version,
            %direction,
            elapsed = ?started.elapsed(),
            "Migrated"
        );
        Ok(())
    }
}

/// Writes an empty `.safe` up/down pair for `name` into `dir`, asking
/// `prompter` first when given. Returns `None` when the operator declines.
pub fn create(
    dir: &Path,
    name: &str,
    prompter: Option<&dyn Prompter>,
) -> Result<Option<(PathBuf, PathBuf)>> {
    let (up, down) = new_file_names(name, Utc::now())?;
    let up = dir.join(up);
    let down = dir.join(down);

    if let Some(prompter) = prompter {
        let message = format!(
            "Create new migration files?\n  {}\n  {}\n",
            up.display(),
            down.display()
        );
        if !prompter.confirm(&message)? {
            return Ok(None);
        }
    }

    fs::create_dir_all(dir).map_err(|err| MigrateError::file(dir, err))?;
    for path in [&up, &down] {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| MigrateError::file(path, err))?;
    }
    info!(up = %up.display(), down = %down.display(), "Created migration files");
    Ok(Some((up, down)))
}

/// Runs a script's statements, inside one transaction when `safely`.
pub(crate) async fn run_statements(
    repo: &dyn Repository,
    ctx: &Context,
    statements: Vec<String>,
    safely: bool,
    compact: bool,
) -> Result<()> {
    if !safely {
        for statement in &statements {
            log_statement(statement, compact);
            repo.exec_query(ctx, statement, &[]).await?;
        }
        return Ok(());
    }
    repo.exec_query_transaction(
        ctx,
        tx_fn(move |tx_ctx| async move {
            for statement in &statements {
                log_statement(statement, compact);
                repo.exec_query(&tx_ctx, statement, &[]).await?;
            }
            Ok(())
        }),
    )
    .await
}

fn log_statement(statement: &str, compact: bool) {
    if compact {
        debug!(statement = %clean_sql(statement), "Executing");
    } else {
        info!(statement = %clean_sql(statement), "Executing");
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
