//! Result sets and exec results.

use std::collections::VecDeque;

use crate::error::{MigrateError, Result};
use crate::value::{FromValue, Value};

/// Conversion from a whole row into a destination tuple.
pub trait FromRow: Sized {
    /// Number of destinations.
    const ARITY: usize;

    /// Converts a row whose length has already been checked.
    fn from_row(row: &[Value]) -> Result<Self>;
}

macro_rules! impl_from_row {
    ($arity:expr; $($idx:tt => $ty:ident),+) => {
        impl<$($ty: FromValue),+> FromRow for ($($ty,)+) {
            const ARITY: usize = $arity;

            fn from_row(row: &[Value]) -> Result<Self> {
                Ok(($($ty::from_value(&row[$idx])?,)+))
            }
        }
    };
}

impl_from_row!(1; 0 => A);
impl_from_row!(2; 0 => A, 1 => B);
impl_from_row!(3; 0 => A, 1 => B, 2 => C);
impl_from_row!(4; 0 => A, 1 => B, 2 => C, 3 => D);
impl_from_row!(5; 0 => A, 1 => B, 2 => C, 3 => D, 4 => E);

/// A materialized, forward-only result set.
///
/// Call [`Rows::next`] to advance, then [`Rows::scan`] or [`Rows::get`] to
/// read the current row.
#[derive(Debug, Clone, Default)]
pub struct Rows {
    columns: Vec<String>,
    pending: VecDeque<Vec<Value>>,
    current: Option<Vec<Value>>,
    closed: bool,
}

impl Rows {
    /// Creates a result set from decoded rows.
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            pending: rows.into(),
            current: None,
            closed: false,
        }
    }

    /// Creates an in-memory result set for tests.
    ///
    /// Each entry is one row: a [`Value::Tuple`] spreads into several
    /// columns, anything else is a single-column row.
    #[must_use]
    pub fn fake(rows: Vec<Value>) -> Self {
        let rows: Vec<Vec<Value>> = rows
            .into_iter()
            .map(|row| match row {
                Value::Tuple(values) => values,
                scalar => vec![scalar],
            })
            .collect();
        let width = rows.first().map_or(0, Vec::len);
        let columns = (0..width).map(|i| format!("column{i}")).collect();
        Self::new(columns, rows)
    }

    /// An empty result set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Column names, when the backend reports them.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows not yet visited.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Advances to the next row.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.current = self.pending.pop_front();
        self.current.is_some()
    }

    /// Reads the current row into a tuple of destinations.
    pub fn scan<T: FromRow>(&self) -> Result<T> {
        let row = self.current.as_ref().ok_or(MigrateError::NoRows)?;
        if row.len() != T::ARITY {
            return Err(MigrateError::ScanArity {
                expected: row.len(),
                got: T::ARITY,
            });
        }
        T::from_row(row)
    }

    /// Reads one column of the current row.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
        let row = self.current.as_ref().ok_or(MigrateError::NoRows)?;
        let value = row.get(index).ok_or(MigrateError::ScanArity {
            expected: row.len(),
            got: index + 1,
        })?;
        T::from_value(value)
    }

    /// Returns the raw values of the current row.
    #[must_use]
    pub fn current(&self) -> Option<&[Value]> {
        self.current.as_deref()
    }

    /// Deferred iteration error. Rows are fully decoded up front, so this
    /// is always `Ok`.
    pub fn err(&self) -> Result<()> {
        Ok(())
    }

    /// Releases the remaining rows.
    pub fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.pending.clear();
        self.current = None;
        Ok(())
    }

    /// Scans every remaining row.
    pub fn collect_all<T: FromRow>(mut self) -> Result<Vec<T>> {
        let mut out = Vec::with_capacity(self.remaining());
        while self.next() {
            out.push(self.scan()?);
        }
        self.close()?;
        Ok(out)
    }

    /// First column of the first row.
    pub fn scalar(mut self) -> Result<Value> {
        if !self.next() {
            return Err(MigrateError::NoRows);
        }
        let value = self
            .current()
            .and_then(|row| row.first())
            .cloned()
            .ok_or(MigrateError::ScanArity {
                expected: 0,
                got: 1,
            })?;
        self.close()?;
        Ok(value)
    }
}

/// Outcome of a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    last_insert_id: Option<i64>,
    rows_affected: Option<u64>,
}

impl ExecResult {
    /// Creates a result; `None` marks a value the driver does not report.
    #[must_use]
    pub const fn new(last_insert_id: Option<i64>, rows_affected: Option<u64>) -> Self {
        Self {
            last_insert_id,
            rows_affected,
        }
    }

    /// A result for drivers that report neither value.
    #[must_use]
    pub const fn unsupported() -> Self {
        Self::new(None, None)
    }

    /// Id generated by the last insert.
    pub fn last_insert_id(&self) -> Result<i64> {
        self.last_insert_id
            .ok_or(MigrateError::NotSupportedByDriver("LastInsertId"))
    }

    /// Number of rows the statement touched.
    pub fn rows_affected(&self) -> Result<i64> {
        let affected = self
            .rows_affected
            .ok_or(MigrateError::NotSupportedByDriver("RowsAffected"))?;
        i64::try_from(affected).map_err(|_| MigrateError::ScanConversion {
            from: "uint",
            to: "i64",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_rows_scan() {
        let mut rows = Rows::fake(vec![
            Value::Tuple(vec![Value::from("v2"), Value::UInt(20)]),
            Value::Tuple(vec![Value::from("v1"), Value::UInt(10)]),
        ]);
        assert_eq!(rows.columns().len(), 2);

        assert!(rows.next());
        let (version, apply_time): (String, i64) = rows.scan().unwrap();
        assert_eq!(version, "v2");
        assert_eq!(apply_time, 20);

        assert!(rows.next());
        assert_eq!(rows.get::<String>(0).unwrap(), "v1");
        assert!(!rows.next());
        assert!(rows.err().is_ok());
    }

    #[test]
    fn test_fake_rows_scalar_entries() {
        let rows = Rows::fake(vec![Value::Int(3), Value::Int(4)]);
        let values: Vec<(u8,)> = rows.collect_all().unwrap();
        assert_eq!(values, vec![(3,), (4,)]);
    }

    #[test]
    fn test_scan_arity_mismatch() {
        let mut rows = Rows::fake(vec![Value::Tuple(vec![Value::Int(1), Value::Int(2)])]);
        assert!(rows.next());
        assert!(matches!(
            rows.scan::<(i64,)>(),
            Err(MigrateError::ScanArity {
                expected: 2,
                got: 1
            })
        ));
        assert!(matches!(
            rows.scan::<(i64, i64, i64)>(),
            Err(MigrateError::ScanArity { .. })
        ));
    }

    #[test]
    fn test_scan_without_row() {
        let rows = Rows::fake(vec![Value::Int(1)]);
        assert!(matches!(rows.scan::<(i64,)>(), Err(MigrateError::NoRows)));
    }

    #[test]
    fn test_close_stops_iteration() {
        let mut rows = Rows::fake(vec![Value::Int(1), Value::Int(2)]);
        assert!(rows.next());
        rows.close().unwrap();
        assert!(!rows.next());
    }

    #[test]
    fn test_scalar() {
        assert_eq!(
            Rows::fake(vec![Value::Int(9)]).scalar().unwrap(),
            Value::Int(9)
        );
        assert!(matches!(Rows::empty().scalar(), Err(MigrateError::NoRows)));
    }

    #[test]
    fn test_exec_result() {
        let res = ExecResult::new(None, Some(2));
        assert_eq!(res.rows_affected().unwrap(), 2);
        assert!(matches!(
            res.last_insert_id(),
            Err(MigrateError::NotSupportedByDriver("LastInsertId"))
        ));

        let res = ExecResult::unsupported();
        assert!(res.rows_affected().is_err());
    }
}
