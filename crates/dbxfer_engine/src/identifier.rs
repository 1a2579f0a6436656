//! Validation and quoting for names that end up inside remote commands.
//!
//! Table, collection and key-pattern names come from transfer requests and from
//! server catalogs. Each one is checked against a conservative character set
//! before any strategy interpolates it, then quoted for the engine and for the
//! shell anyway.

use dbxfer_contract::{DatabaseKind, TransferOptions};

use crate::error::IdentifierError;

pub const MAX_NAME_LENGTH: usize = 128;
pub const MAX_PATTERN_LENGTH: usize = 256;

fn is_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-')
}

fn is_pattern_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            '_' | ':' | '.' | '*' | '?' | '@' | '/' | '#' | '=' | '+' | '-' | '[' | ']'
        )
}

/// Table or collection name, optionally qualified as `schema.name`.
pub fn validate_name(what: &'static str, name: &str) -> Result<(), IdentifierError> {
    if name.is_empty() {
        return Err(IdentifierError::Empty { what });
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(IdentifierError::TooLong {
            what,
            name: name.to_string(),
            max: MAX_NAME_LENGTH,
        });
    }
    if let Some(found) = name.chars().find(|ch| !is_name_char(*ch) && *ch != '.') {
        return Err(IdentifierError::Forbidden {
            what,
            name: name.to_string(),
            found,
        });
    }
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 || parts.iter().any(|part| part.is_empty()) {
        return Err(IdentifierError::Malformed {
            what,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Glob pattern for key-value `SCAN MATCH`.
pub fn validate_key_pattern(pattern: &str) -> Result<(), IdentifierError> {
    let what = "key pattern";
    if pattern.is_empty() {
        return Err(IdentifierError::Empty { what });
    }
    if pattern.chars().count() > MAX_PATTERN_LENGTH {
        return Err(IdentifierError::TooLong {
            what,
            name: pattern.to_string(),
            max: MAX_PATTERN_LENGTH,
        });
    }
    if let Some(found) = pattern.chars().find(|ch| !is_pattern_char(*ch)) {
        return Err(IdentifierError::Forbidden {
            what,
            name: pattern.to_string(),
            found,
        });
    }
    Ok(())
}

/// Table name for engines where a dot would address another database.
pub fn validate_unqualified_name(what: &'static str, name: &str) -> Result<(), IdentifierError> {
    validate_name(what, name)?;
    if name.contains('.') {
        return Err(IdentifierError::Qualified {
            what,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Engine-aware check: MySQL and MariaDB dumps take bare table names.
pub fn validate_options_for(
    kind: DatabaseKind,
    options: &TransferOptions,
) -> Result<(), IdentifierError> {
    match (kind, options) {
        (DatabaseKind::Mysql | DatabaseKind::Mariadb, TransferOptions::Tables(names)) => names
            .iter()
            .try_for_each(|name| validate_unqualified_name("table", name)),
        _ => validate_options(options),
    }
}

pub fn validate_options(options: &TransferOptions) -> Result<(), IdentifierError> {
    match options {
        TransferOptions::Tables(names) => names
            .iter()
            .try_for_each(|name| validate_name("table", name)),
        TransferOptions::Collections(names) => names
            .iter()
            .try_for_each(|name| validate_name("collection", name)),
        TransferOptions::KeyPatterns(patterns) => patterns
            .iter()
            .try_for_each(|pattern| validate_key_pattern(pattern)),
    }
}

/// Splits `schema.table` into its parts. Unqualified names have no schema.
pub fn split_qualified(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}

/// `"schema"."table"` for PostgreSQL.
pub fn quote_pg(name: &str) -> String {
    let quote_part = |part: &str| format!("\"{}\"", part.replace('"', "\"\""));
    match split_qualified(name) {
        (Some(schema), table) => format!("{}.{}", quote_part(schema), quote_part(table)),
        (None, table) => quote_part(table),
    }
}

/// `` `table` `` for MySQL and ClickHouse.
pub fn quote_backtick(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Single-quoted SQL string literal.
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}
