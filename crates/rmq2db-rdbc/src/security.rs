//! Identifier checks for configured table and column names.
//!
//! Every identifier is quoted by [`crate::dialect::PostgresDialect`] before it
//! reaches SQL text, so quoting alone prevents injection. These checks catch
//! names PostgreSQL would silently mangle:
//! - Empty names
//! - Names longer than 63 bytes (the server truncates them, which can make
//!   two configured columns collide)
//! - NUL bytes, which the wire protocol cannot carry

use crate::error::Error;

/// Longest identifier PostgreSQL keeps without truncation (NAMEDATALEN - 1)
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Validate a table, schema or column name.
///
/// # Examples
///
/// ```
/// use rmq2db_rdbc::security::validate_identifier;
///
/// assert!(validate_identifier("roomtemp").is_ok());
/// assert!(validate_identifier("Room Temp").is_ok());
/// assert!(validate_identifier("x\"; DROP TABLE users--").is_ok()); // quoted, harmless
///
/// assert!(validate_identifier("").is_err());
/// assert!(validate_identifier(&"a".repeat(64)).is_err());
/// ```
pub fn validate_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::config(format!(
            "SQL identifier '{}' too long: {} bytes (max {})",
            name,
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    if name.contains('\0') {
        return Err(Error::config(format!(
            "SQL identifier '{}' contains a NUL byte",
            name.escape_default()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_quoted_names() {
        assert!(validate_identifier("room_id").is_ok());
        assert!(validate_identifier("123abc").is_ok());
        assert!(validate_identifier("with\"quote").is_ok());
    }

    #[test]
    fn test_length_boundary() {
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LEN)).is_ok());
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
    }

    #[test]
    fn test_rejects_nul() {
        assert!(validate_identifier("a\0b").is_err());
    }
}
