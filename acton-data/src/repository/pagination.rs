//! Offset and cursor pagination types
//!
//! Cursor pages are ordered by the entity identifier. A [`Cursor`] travels as
//! an opaque url-safe base64 token wrapping `{"id": ..., "direction": ...}`;
//! callers should treat it as a string and hand it back unchanged.
//!
//! # Example
//!
//! ```rust
//! use acton_data::repository::{Cursor, CursorDirection};
//!
//! let token = Cursor::new("wdg_01h455vb4pex5vsknk084sn02q", CursorDirection::Next).encode();
//! let cursor = Cursor::decode(&token).unwrap();
//! assert_eq!(cursor.direction, CursorDirection::Next);
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RepositoryConfig;
use crate::error::{DatabaseError, DbResult};

/// Direction for ordering results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    /// Sort in ascending order (A-Z, 0-9)
    #[default]
    Ascending,
    /// Sort in descending order (Z-A, 9-0)
    Descending,
}

impl OrderDirection {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascending => write!(f, "asc"),
            Self::Descending => write!(f, "desc"),
        }
    }
}

/// Offset pagination parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Number of results to skip
    pub offset: i64,
    /// Maximum number of results to return
    pub limit: i64,
}

impl Pagination {
    #[must_use]
    pub const fn new(offset: i64, limit: i64) -> Self {
        Self { offset, limit }
    }

    /// Pagination for a 1-indexed page number
    #[must_use]
    pub const fn page(page_number: i64, page_size: i64) -> Self {
        let page_number = if page_number < 1 { 1 } else { page_number };
        Self {
            offset: (page_number - 1).saturating_mul(page_size),
            limit: page_size,
        }
    }

    /// Negative offsets become 0; limits are clamped by `config`
    #[must_use]
    pub fn normalized(self, config: &RepositoryConfig) -> Self {
        Self {
            offset: self.offset.max(0),
            limit: config.clamp_limit(self.limit),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 20,
        }
    }
}

/// Which way a cursor page walks the identifier order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorDirection {
    /// Identifiers greater than the cursor, ascending
    #[default]
    Next,
    /// Identifiers less than the cursor, descending
    Prev,
}

impl CursorDirection {
    /// Parse a direction; anything unrecognized is `Next`
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prev" | "previous" | "backward" => Self::Prev,
            _ => Self::Next,
        }
    }

    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Self::Next => Self::Prev,
            Self::Prev => Self::Next,
        }
    }

    pub(crate) fn order(&self) -> OrderDirection {
        match self {
            Self::Next => OrderDirection::Ascending,
            Self::Prev => OrderDirection::Descending,
        }
    }
}

impl From<&str> for CursorDirection {
    fn from(value: &str) -> Self {
        Self::parse_lenient(value)
    }
}

impl fmt::Display for CursorDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next => write!(f, "next"),
            Self::Prev => write!(f, "prev"),
        }
    }
}

/// Position in an identifier-ordered listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Identifier of the last row seen
    pub id: String,
    pub direction: CursorDirection,
}

impl Cursor {
    pub fn new(id: impl Into<String>, direction: CursorDirection) -> Self {
        Self {
            id: id.into(),
            direction,
        }
    }

    /// Opaque token form
    pub fn encode(&self) -> String {
        // Serializing two plain fields cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Parse a token produced by [`Cursor::encode`]
    pub fn decode(token: &str) -> DbResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim().trim_end_matches('='))
            .map_err(|e| invalid_cursor(e.to_string()))?;
        let raw: RawCursor =
            serde_json::from_slice(&bytes).map_err(|e| invalid_cursor(e.to_string()))?;
        if raw.id.is_empty() {
            return Err(invalid_cursor("cursor has an empty id"));
        }
        Ok(Self {
            id: raw.id,
            direction: raw
                .direction
                .as_deref()
                .map(CursorDirection::parse_lenient)
                .unwrap_or_default(),
        })
    }
}

/// Wire form accepting any direction string
#[derive(Deserialize)]
struct RawCursor {
    id: String,
    #[serde(default)]
    direction: Option<String>,
}

fn invalid_cursor(detail: impl fmt::Display) -> DatabaseError {
    DatabaseError::invalid_argument("decode_cursor", format!("malformed cursor: {}", detail))
        .with_user_message("The pagination cursor is invalid")
}

/// One page of a cursor listing
#[derive(Debug, Clone, PartialEq)]
pub struct CursorPage<T> {
    /// Rows in walk order: ascending identifiers for `next`, descending for `prev`
    pub items: Vec<T>,
    /// Continues in the same direction; `None` once no rows remain
    pub next_cursor: Option<String>,
    /// Walks back; `None` on the first page
    ///
    /// The listing follows the `direction` argument, not the token, so pass
    /// this back with the page's direction reversed. The token records that
    /// direction and [`Cursor::decode`] exposes it.
    pub prev_cursor: Option<String>,
}

impl<T> CursorPage<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
            prev_cursor: None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_order_direction_display() {
        assert_eq!(format!("{}", OrderDirection::Ascending), "asc");
        assert_eq!(format!("{}", OrderDirection::Descending), "desc");
        assert_eq!(OrderDirection::default(), OrderDirection::Ascending);
    }

    #[test]
    fn test_pagination_page() {
        assert_eq!(Pagination::page(1, 20).offset, 0);
        assert_eq!(Pagination::page(3, 20).offset, 40);
        assert_eq!(Pagination::page(0, 20).offset, 0);
    }

    #[test]
    fn test_pagination_normalized() {
        let config = RepositoryConfig::default();
        assert_eq!(Pagination::new(-5, -1).normalized(&config), Pagination::new(0, 20));
        assert_eq!(Pagination::new(10, 500).normalized(&config), Pagination::new(10, 100));
        assert_eq!(Pagination::new(3, 7).normalized(&config), Pagination::new(3, 7));
    }

    #[test]
    fn test_cursor_direction_is_lenient() {
        assert_eq!(CursorDirection::from("prev"), CursorDirection::Prev);
        assert_eq!(CursorDirection::from("PREV"), CursorDirection::Prev);
        assert_eq!(CursorDirection::from("next"), CursorDirection::Next);
        assert_eq!(CursorDirection::from("sideways"), CursorDirection::Next);
        assert_eq!(CursorDirection::from(""), CursorDirection::Next);
        assert_eq!(CursorDirection::Next.reversed(), CursorDirection::Prev);
    }

    #[test]
    fn test_cursor_token_is_url_safe() {
        let token = Cursor::new("wdg_01h455vb4pex5vsknk084sn02q", CursorDirection::Prev).encode();
        assert!(!token.contains('+') && !token.contains('/') && !token.contains('='));

        let cursor = Cursor::decode(&token).unwrap();
        assert_eq!(cursor.id, "wdg_01h455vb4pex5vsknk084sn02q");
        assert_eq!(cursor.direction, CursorDirection::Prev);
    }

    #[test]
    fn test_cursor_with_unknown_direction_decodes_as_next() {
        let token = URL_SAFE_NO_PAD.encode(br#"{"id":"wdg_1","direction":"up"}"#);
        assert_eq!(Cursor::decode(&token).unwrap().direction, CursorDirection::Next);

        let token = URL_SAFE_NO_PAD.encode(br#"{"id":"wdg_1"}"#);
        assert_eq!(Cursor::decode(&token).unwrap().direction, CursorDirection::Next);
    }

    #[test]
    fn test_garbage_cursor_is_invalid_argument() {
        for token in ["%%%", "bm90IGpzb24", ""] {
            let error = Cursor::decode(token).unwrap_err();
            assert_eq!(error.kind, ErrorKind::InvalidArgument);
        }

        let token = URL_SAFE_NO_PAD.encode(br#"{"id":""}"#);
        assert!(Cursor::decode(&token).is_err());
    }
}
