//! Multi-statement script scanner.
//!
//! Splits a script into statements on `;`. Procedural bodies wrapped in
//! `$$ ... $$` are opaque, so a `;` inside them does not end the statement.

use std::io::BufRead;

use crate::error::{MigrateError, Result};

/// Per-statement buffer cap.
pub const MAX_STATEMENT_SIZE: usize = 10 * 1024 * 1024;

const INITIAL_CAPACITY: usize = 4 * 1024;

/// Lazy iterator over the trimmed, non-empty statements of a reader.
pub struct StatementScanner<R> {
    reader: R,
    buffer: Vec<u8>,
    max_size: usize,
    in_block: bool,
    saw_block: bool,
    prev_dollar: bool,
    done: bool,
}

impl<R: BufRead> StatementScanner<R> {
    /// Creates a scanner with the default statement cap.
    pub fn new(reader: R) -> Self {
        Self::with_max_size(reader, MAX_STATEMENT_SIZE)
    }

    /// Creates a scanner with a custom statement cap.
    pub fn with_max_size(reader: R, max_size: usize) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(INITIAL_CAPACITY.min(max_size)),
            max_size,
            in_block: false,
            saw_block: false,
            prev_dollar: false,
            done: false,
        }
    }

    fn take_statement(&mut self) -> Result<Option<String>> {
        let bytes = std::mem::take(&mut self.buffer);
        self.saw_block = false;
        let text = String::from_utf8(bytes).map_err(|e| {
            MigrateError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let trimmed = text.trim();
        Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
    }

    fn fail(&mut self, err: MigrateError) -> Option<Result<String>> {
        self.done = true;
        self.buffer.clear();
        Some(Err(err))
    }

    fn finish(&mut self) -> Option<Result<String>> {
        self.done = true;
        if self.in_block {
            return Some(Err(MigrateError::UnclosedBlock));
        }
        let saw_block = self.saw_block;
        match self.take_statement() {
            Ok(Some(_)) if saw_block => Some(Err(MigrateError::UnclosedBlock)),
            Ok(statement) => statement.map(Ok),
            Err(err) => Some(Err(err)),
        }
    }
}

impl<R: BufRead> Iterator for StatementScanner<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let chunk = match self.reader.fill_buf() {
                Ok(chunk) => chunk,
                Err(err) => return self.fail(err.into()),
            };
            if chunk.is_empty() {
                return self.finish();
            }

            let mut consumed = chunk.len();
            let mut complete = false;
            for (i, &byte) in chunk.iter().enumerate() {
                if byte == b'$' {
                    if self.prev_dollar {
                        self.in_block = !self.in_block;
                        self.saw_block = true;
                        self.prev_dollar = false;
                    } else {
                        self.prev_dollar = true;
                    }
                } else {
                    self.prev_dollar = false;
                    if byte == b';' && !self.in_block {
                        consumed = i + 1;
                        complete = true;
                        break;
                    }
                }
                self.buffer.push(byte);
            }
            self.reader.consume(consumed);

            if self.buffer.len() > self.max_size {
                let limit = self.max_size;
                return self.fail(MigrateError::StatementTooLarge { limit });
            }

            if complete {
                match self.take_statement() {
                    Ok(Some(statement)) => return Some(Ok(statement)),
                    Ok(None) => continue,
                    Err(err) => return self.fail(err),
                }
            }
        }
    }
}

/// Scans an in-memory script.
pub fn statements(script: &str) -> StatementScanner<&[u8]> {
    StatementScanner::new(script.as_bytes())
}

/// Collapses every whitespace run to a single space and trims the ends.
#[must_use]
pub fn clean_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}
