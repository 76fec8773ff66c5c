//! Identifier validation and quoting.
//!
//! Table and column names come from the migration plan and cannot be bound as
//! statement parameters, so every identifier is validated and quoted before it
//! is spliced into SQL.

use crate::error::{MigrateError, Result};

/// PostgreSQL truncates identifiers longer than this.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier.
///
/// Rejects empty identifiers, identifiers containing null bytes, and
/// identifiers longer than PostgreSQL keeps.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier, doubling embedded quotes.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a schema-qualified table name.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Quote a list of column names and join them with commas.
pub fn quote_pg_list(names: &[String]) -> Result<String> {
    let quoted = names
        .iter()
        .map(|n| quote_pg(n))
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}
