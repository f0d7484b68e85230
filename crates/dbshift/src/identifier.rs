//! Identifier validation.
//!
//! Table, schema and cluster names end up interpolated into DDL, so they are
//! restricted to `[A-Za-z0-9_]` before any repository is constructed.

use crate::error::{IdentifierViolation, MigrateError, Result};

/// Maximum identifier length in bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = 65000;

/// Validates an identifier. The empty string is accepted, since every
/// identifier input is optional.
pub fn validate(name: &str) -> Result<()> {
    if let Some(character) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(MigrateError::InvalidIdentifier {
            name: name.to_string(),
            violation: IdentifierViolation::Character(character),
        });
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::InvalidIdentifier {
            name: name.to_string(),
            violation: IdentifierViolation::TooLong {
                length: name.len(),
                max: MAX_IDENTIFIER_LENGTH,
            },
        });
    }

    Ok(())
}

/// Validates every identifier in order, stopping at the first failure.
pub fn validate_all<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    names.into_iter().try_for_each(validate)
}

/// Splits `schema.table`. Without a dot, the schema is `None`.
#[must_use]
pub fn split_qualified(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}
