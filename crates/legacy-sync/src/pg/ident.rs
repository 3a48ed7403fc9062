//! Identifier validation and quoting for dynamically built PostgreSQL SQL.
//!
//! Table and column names come from the entity catalog and cannot be bound
//! as statement parameters, so every one of them goes through [`quote`].

use crate::error::{MigrateError, Result};

/// PostgreSQL truncates identifiers at 63 bytes.
const MAX_IDENTIFIER_LENGTH: usize = 63;

const DEFAULT_SCHEMA: &str = "public";

/// Reject empty, oversized, or null-byte identifiers.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config("identifier cannot be empty".into()));
    }
    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "identifier contains a null byte: {:?}",
            name
        )));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "identifier exceeds {} bytes (got {}): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }
    Ok(())
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Split a `schema.table` location. A bare name lives in `public`.
pub fn split_location(location: &str) -> (&str, &str) {
    match location.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => (DEFAULT_SCHEMA, location),
    }
}

/// Quoted `"schema"."table"` for an entity location.
pub fn qualify(location: &str) -> Result<String> {
    let (schema, table) = split_location(location);
    Ok(format!("{}.{}", quote(schema)?, quote(table)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("offices").unwrap(), "\"offices\"");
        assert_eq!(quote("odd\"name").unwrap(), "\"odd\"\"name\"");
        assert!(quote("").is_err());
        assert!(quote("bad\0name").is_err());
        assert!(quote(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify("legacy.tbl_office").unwrap(), "\"legacy\".\"tbl_office\"");
        assert_eq!(qualify("offices").unwrap(), "\"public\".\"offices\"");
        assert_eq!(split_location("a.b.c"), ("a", "b.c"));
    }
}
