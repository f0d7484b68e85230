//! Error types for the migration system.

use std::fmt;
use std::path::PathBuf;

/// A backend error translated into a driver-neutral shape.
///
/// `code` is the native SQLSTATE (PostgreSQL) or numeric code (ClickHouse,
/// MySQL, Tarantool) rendered as a string. The original driver error is kept
/// as `cause` so callers can walk the chain down to it.
#[derive(Debug, thiserror::Error)]
#[error("{severity} {code}: {message}")]
pub struct DbError {
    /// Native error code.
    pub code: String,
    /// Severity reported by the backend (`ERROR`, `ERR`, ...).
    pub severity: String,
    /// Primary message.
    pub message: String,
    /// Additional detail, when the backend provides one.
    pub details: String,
    /// The query the backend reports, or the one that was sent.
    pub internal_query: String,
    /// The untranslated driver error.
    #[source]
    pub cause: Box<MigrateError>,
}

/// An exception returned by the ClickHouse HTTP interface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("code {code} ({name}): {message}")]
pub struct ClickHouseException {
    /// Numeric exception code.
    pub code: i32,
    /// Symbolic name such as `UNKNOWN_TABLE`, empty when not reported.
    pub name: String,
    /// Exception text.
    pub message: String,
}

/// An error response from a Tarantool instance.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("tarantool error {code}: {message}")]
pub struct TarantoolError {
    /// Box error code.
    pub code: u32,
    /// Error message.
    pub message: String,
}

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// The DSN could not be parsed.
    #[error("invalid DSN: {0}")]
    InvalidDsn(String),

    /// The DSN names a driver this crate cannot talk to.
    #[error("unsupported driver: {0}")]
    UnsupportedDriver(String),

    /// An identifier is not a plain `[A-Za-z0-9_]` name within the length
    /// cap.
    #[error("invalid identifier '{name}': {violation}")]
    InvalidIdentifier {
        /// The rejected identifier.
        name: String,
        /// What is wrong with it.
        violation: IdentifierViolation,
    },

    /// A migration name passed to `create` is malformed.
    #[error("invalid migration name '{0}': only [A-Za-z0-9_] allowed")]
    InvalidMigrationName(String),

    /// A version argument does not look like a migration version.
    #[error("invalid migration version '{0}'")]
    InvalidVersion(String),

    /// A limit argument is neither `all` nor a positive integer.
    #[error("invalid limit '{0}': expected a positive integer or 'all'")]
    InvalidLimit(String),

    /// Two files resolve to the same version and direction.
    #[error("duplicate migration file for version {version}: {path}")]
    DuplicateMigration {
        /// The duplicated version.
        version: String,
        /// The second file found.
        path: PathBuf,
    },

    /// The migration to insert is already recorded.
    #[error("migration {0} already exists")]
    MigrationAlreadyExists(String),

    /// The migration to revert is not recorded.
    #[error("applied migration {0} not found")]
    AppliedMigrationNotFound(String),

    /// No file on disk matches the requested version.
    #[error("migration {0} not found")]
    MigrationNotFound(String),

    /// The context already carries a transaction.
    #[error("transaction already opened")]
    TransactionAlreadyOpened,

    /// An operation needed a transaction but the context has none.
    #[error("no transaction in context")]
    NoTransactionInContext,

    /// The transaction was already committed or rolled back.
    #[error("transaction already closed")]
    TransactionAlreadyClosed,

    /// A NULL was scanned into a destination that cannot hold it.
    #[error("nil value cannot be scanned into {0}")]
    NilValue(&'static str),

    /// A non-scalar value was scanned into a scalar destination.
    #[error("value must be a scalar to be scanned into {0}")]
    NotScalar(&'static str),

    /// A scalar could not be coerced into the destination type.
    #[error("cannot convert {from} into {to}")]
    ScanConversion {
        /// Source value kind.
        from: &'static str,
        /// Destination type.
        to: &'static str,
    },

    /// The row has a different number of columns than destinations.
    #[error("expected {expected} destination arguments in scan, not {got}")]
    ScanArity {
        /// Number of columns in the row.
        expected: usize,
        /// Number of destinations.
        got: usize,
    },

    /// Scan was called without a current row.
    #[error("no rows in result set")]
    NoRows,

    /// The driver does not implement the requested capability.
    #[error("{0} is not supported by this driver")]
    NotSupportedByDriver(&'static str),

    /// Placeholder count does not match the argument count.
    #[error("bind error: {0}")]
    Bind(String),

    /// A `$$` block (or its statement) was not terminated before EOF.
    #[error("unclosed block: a $$ block must be closed and terminated by ';'")]
    UnclosedBlock,

    /// A single statement exceeds the scanner buffer cap.
    #[error("statement exceeds the {limit} byte limit")]
    StatementTooLarge {
        /// The cap in bytes.
        limit: usize,
    },

    /// IO error on a specific migration file.
    #[error("failed to read migration file '{path}': {source}")]
    File {
        /// The file being read or written.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// IO error (reading/writing migration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the PostgreSQL or MySQL driver.
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Transport error talking to ClickHouse.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Exception raised by ClickHouse.
    #[error("ClickHouse exception: {0}")]
    ClickHouse(#[from] ClickHouseException),

    /// Error response from Tarantool.
    #[error(transparent)]
    Tarantool(#[from] TarantoolError),

    /// Malformed data on a wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Generic driver failure without a native error type.
    #[error("driver error: {0}")]
    Driver(String),

    /// A translated backend error.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The ambient context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The transaction body failed and so did the rollback.
    #[error("{source} (rollback failed: {rollback})")]
    Rollback {
        /// Error returned by the transaction body.
        source: Box<MigrateError>,
        /// Error returned by the rollback.
        rollback: Box<MigrateError>,
    },

    /// Commit failed; the transaction was rolled back.
    #[error("commit failed: {source}")]
    Commit {
        /// Error returned by the commit.
        source: Box<MigrateError>,
    },

    /// A migration failed part-way through a run.
    #[error("migration {version} failed ({done} of {total} applied): {source}")]
    MigrationFailed {
        /// Version of the failing migration.
        version: String,
        /// Number of migrations that completed before the failure.
        done: usize,
        /// Number of migrations planned.
        total: usize,
        /// The underlying failure.
        source: Box<MigrateError>,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MigrateError {
    /// Wraps an IO error with the file it happened on.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// Returns the translated backend error, if this is (or wraps) one.
    #[must_use]
    pub fn as_db_error(&self) -> Option<&DbError> {
        match self {
            Self::Db(err) => Some(err),
            Self::MigrationFailed { source, .. }
            | Self::Commit { source }
            | Self::Rollback { source, .. } => source.as_db_error(),
            _ => None,
        }
    }
}

/// The rule an identifier broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierViolation {
    /// The first character outside `[A-Za-z0-9_]`.
    Character(char),
    /// Byte length over the cap.
    TooLong {
        /// Length of the rejected identifier.
        length: usize,
        /// Maximum allowed length.
        max: usize,
    },
}

impl fmt::Display for IdentifierViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Character(c) => write!(f, "invalid character '{c}'"),
            Self::TooLong { length, max } => write!(f, "length {length} exceeds {max}"),
        }
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
