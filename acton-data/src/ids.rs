//! Type-safe identifiers using the TypeID specification
//!
//! Entity identifiers are TypeIDs over UUIDv7: `<prefix>_<base32 suffix>`.
//! The suffix encodes the creation time first, so identifiers created later
//! compare greater as plain strings. Cursor pagination relies on that.
//!
//! ```rust
//! use acton_data::ids::{IdGenerator, TypeIdGenerator};
//!
//! let id = TypeIdGenerator.generate("wdg");
//! assert!(id.starts_with("wdg_"));
//! ```

use mti::prelude::*;
use once_cell::sync::Lazy;
use regex::Regex;
use std::str::FromStr;

use crate::error::{DatabaseError, DbResult};

static PREFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-z]([a-z_]{0,61}[a-z])?)?$").expect("invalid prefix regex"));

/// Source of new entity identifiers
pub trait IdGenerator: Send + Sync {
    /// Produce a new identifier carrying `prefix`
    fn generate(&self, prefix: &str) -> String;
}

/// Default generator producing UUIDv7 TypeIDs
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeIdGenerator;

impl IdGenerator for TypeIdGenerator {
    fn generate(&self, prefix: &str) -> String {
        prefix.create_type_id::<V7>().to_string()
    }
}

/// Whether `prefix` is usable as a TypeID prefix
pub fn is_valid_prefix(prefix: &str) -> bool {
    PREFIX_PATTERN.is_match(prefix)
}

/// Parse an identifier and check that it carries the expected prefix
pub fn parse_id(expected_prefix: &str, id: &str) -> DbResult<MagicTypeId> {
    let parsed = MagicTypeId::from_str(id).map_err(|e| {
        DatabaseError::invalid_argument("parse_id", format!("malformed identifier '{}': {}", id, e))
    })?;

    if parsed.prefix().as_str() != expected_prefix {
        return Err(DatabaseError::invalid_argument(
            "parse_id",
            format!(
                "invalid prefix: expected '{}', got '{}'",
                expected_prefix,
                parsed.prefix().as_str()
            ),
        ));
    }

    Ok(parsed)
}
