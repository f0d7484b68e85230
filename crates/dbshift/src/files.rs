//! Migration files on disk.
//!
//! A migration is a pair of scripts named
//! `<YYMMDD>_<HHMMSS>_<name>[.safe].(up|down).sql`. The part before the
//! first dot is the version; `.safe` asks for the script to run inside a
//! transaction.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::error::{MigrateError, Result};
use crate::scanner::StatementScanner;

/// Matches a migration file name; group 1 is the version, group 2 the
/// optional `safe.` marker, group 3 the direction.
pub static FILE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{6}_?\d{6}[A-Za-z0-9_]+)\.(safe\.)?(up|down)\.sql$")
        .expect("Invalid file name regex")
});

/// Matches a bare version as accepted by `to`.
pub static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{6}_?\d{6}[A-Za-z0-9_]+$").expect("Invalid version regex")
});

/// Matches a name accepted by `create`.
pub static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("Invalid name regex"));

/// Format of the timestamp prefix given to new migrations.
pub const VERSION_PREFIX_FORMAT: &str = "%y%m%d_%H%M%S";

/// Which way a script moves the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Applies a migration.
    Up,
    /// Reverts a migration.
    Down,
}

impl Direction {
    /// File name suffix without the optional `safe.` marker.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Up => "up.sql",
            Self::Down => "down.sql",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
        })
    }
}

/// A script found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    /// Version, the file name up to the first dot.
    pub version: String,
    /// Whether the file carries the `.safe` marker.
    pub safely: bool,
    /// Direction of the script.
    pub direction: Direction,
    /// Full path.
    pub path: PathBuf,
}

impl MigrationFile {
    /// Parses a file name. Returns `None` for anything that is not a
    /// migration script.
    #[must_use]
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let caps = FILE_NAME_RE.captures(name)?;
        let direction = match &caps[3] {
            "up" => Direction::Up,
            _ => Direction::Down,
        };
        Some(Self {
            version: caps[1].to_string(),
            safely: caps.get(2).is_some(),
            direction,
            path: path.to_path_buf(),
        })
    }

    /// Reads and splits the script into statements.
    pub fn statements(&self) -> Result<Vec<String>> {
        let file = File::open(&self.path).map_err(|err| MigrateError::file(&self.path, err))?;
        StatementScanner::new(BufReader::new(file))
            .collect::<Result<Vec<_>>>()
            .map_err(|err| match err {
                MigrateError::Io(source) => MigrateError::file(&self.path, source),
                other => other,
            })
    }
}

/// Every migration script in a directory, keyed by version.
#[derive(Debug, Clone, Default)]
pub struct MigrationFiles {
    up: BTreeMap<String, MigrationFile>,
    down: BTreeMap<String, MigrationFile>,
}

impl MigrationFiles {
    /// Scans `dir` (not recursively). Two scripts with the same version and
    /// direction fail with [`MigrateError::DuplicateMigration`].
    pub fn scan(dir: &Path) -> Result<Self> {
        let entries = fs::read_dir(dir).map_err(|err| MigrateError::file(dir, err))?;
        let mut files = Self::default();
        for entry in entries {
            let entry = entry.map_err(|err| MigrateError::file(dir, err))?;
            if !entry.file_type().map_err(|err| MigrateError::file(entry.path(), err))?.is_file() {
                continue;
            }
            match MigrationFile::parse(&entry.path()) {
                Some(file) => files.insert(file)?,
                None => debug!(path = %entry.path().display(), "skipping non-migration file"),
            }
        }
        Ok(files)
    }

    /// Adds a file, rejecting a second script for the same version and
    /// direction.
    pub fn insert(&mut self, file: MigrationFile) -> Result<()> {
        let map = match file.direction {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        };
        if map.contains_key(&file.version) {
            return Err(MigrateError::DuplicateMigration {
                version: file.version,
                path: file.path,
            });
        }
        map.insert(file.version.clone(), file);
        Ok(())
    }

    /// The script for `version` in `direction`.
    #[must_use]
    pub fn get(&self, version: &str, direction: Direction) -> Option<&MigrationFile> {
        match direction {
            Direction::Up => self.up.get(version),
            Direction::Down => self.down.get(version),
        }
    }

    /// Up scripts in ascending version order.
    pub fn ups(&self) -> impl Iterator<Item = &MigrationFile> {
        self.up.values()
    }

    /// Whether any script exists for `version`.
    #[must_use]
    pub fn contains(&self, version: &str) -> bool {
        self.up.contains_key(version) || self.down.contains_key(version)
    }

    /// Whether the directory holds no migrations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.up.is_empty() && self.down.is_empty()
    }
}

/// Checks a version argument.
pub fn validate_version(version: &str) -> Result<()> {
    if VERSION_RE.is_match(version) {
        Ok(())
    } else {
        Err(MigrateError::InvalidVersion(version.to_string()))
    }
}

/// File names for a new migration created at `at`: the up script first.
pub fn new_file_names(name: &str, at: DateTime<Utc>) -> Result<(String, String)> {
    if !NAME_RE.is_match(name) {
        return Err(MigrateError::InvalidMigrationName(name.to_string()));
    }
    let version = format!("{}_{name}", at.format(VERSION_PREFIX_FORMAT));
    Ok((
        format!("{version}.safe.{}", Direction::Up.suffix()),
        format!("{version}.safe.{}", Direction::Down.suffix()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_parse_file_names() {
        let file = MigrationFile::parse(Path::new("/m/210328_221600_create_users.up.sql")).unwrap();
        assert_eq!(file.version, "210328_221600_create_users");
        assert_eq!(file.direction, Direction::Up);
        assert!(!file.safely);

        let file = MigrationFile::parse(Path::new("210328221600_a.safe.down.sql")).unwrap();
        assert_eq!(file.version, "210328221600_a");
        assert_eq!(file.direction, Direction::Down);
        assert!(file.safely);

        for name in [
            "README.md",
            "210328_221600.up.sql",
            "21032_221600_a.up.sql",
            "210328_221600_a.sideways.sql",
            "210328_221600_a-b.up.sql",
            "210328_221600_a.up.sql.bak",
        ] {
            assert!(MigrationFile::parse(Path::new(name)).is_none(), "{name}");
        }
    }

    #[test]
    fn test_scan_directory() {
        let dir = TempDir::new().unwrap();
        for name in [
            "210329_121500_b.up.sql",
            "210328_221600_a.safe.up.sql",
            "210328_221600_a.safe.down.sql",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), "SELECT 1;").unwrap();
        }
        fs::create_dir(dir.path().join("210330_000000_dir.up.sql")).unwrap();

        let files = MigrationFiles::scan(dir.path()).unwrap();
        let ups: Vec<&str> = files.ups().map(|f| f.version.as_str()).collect();
        assert_eq!(ups, vec!["210328_221600_a", "210329_121500_b"]);
        assert!(files.get("210328_221600_a", Direction::Down).is_some());
        assert!(files.get("210329_121500_b", Direction::Down).is_none());
        assert!(files.contains("210329_121500_b"));
        assert!(!files.contains("210330_000000_dir"));
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("210328_221600_a.up.sql"), "").unwrap();
        fs::write(dir.path().join("210328_221600_a.safe.up.sql"), "").unwrap();
        let err = MigrationFiles::scan(dir.path()).unwrap_err();
        assert!(
            matches!(err, MigrateError::DuplicateMigration { ref version, .. } if version == "210328_221600_a")
        );
    }

    #[test]
    fn test_read_statements() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("210328_221600_a.up.sql");
        fs::write(&path, "CREATE TABLE t(id int);\nINSERT INTO t VALUES(1);\n").unwrap();
        let file = MigrationFile::parse(&path).unwrap();
        assert_eq!(
            file.statements().unwrap(),
            vec!["CREATE TABLE t(id int)", "INSERT INTO t VALUES(1)"]
        );
    }

    #[test]
    fn test_missing_file_names_path() {
        let file = MigrationFile::parse(Path::new("/nonexistent/210328_221600_a.up.sql")).unwrap();
        let err = file.statements().unwrap_err();
        assert!(err.to_string().contains("210328_221600_a.up.sql"));
    }

    #[test]
    fn test_new_file_names() {
        let at = Utc.with_ymd_and_hms(2021, 3, 28, 22, 16, 0).unwrap();
        let (up, down) = new_file_names("create_users", at).unwrap();
        assert_eq!(up, "210328_221600_create_users.safe.up.sql");
        assert_eq!(down, "210328_221600_create_users.safe.down.sql");
        assert!(MigrationFile::parse(Path::new(&up)).unwrap().safely);

        assert!(matches!(
            new_file_names("drop users", at),
            Err(MigrateError::InvalidMigrationName(_))
        ));
        assert!(new_file_names("", at).is_err());
    }

    #[test]
    fn test_validate_version() {
        assert!(validate_version("210328_221600_a").is_ok());
        assert!(validate_version("210328221600_a").is_ok());
        assert!(validate_version("latest").is_err());
        assert!(validate_version("210328_221600_a.up.sql").is_err());
    }
}
