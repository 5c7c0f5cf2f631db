//! Entity mapping
//!
//! An [`Entity`] describes its table through a [`TableSchema`] and maps
//! itself to and from rows explicitly. Every table carries the identifier
//! column `id` (text) followed by the entity's data columns and the six
//! audit columns in [`AUDIT_COLUMNS`]. Timestamps are Unix milliseconds in
//! `BIGINT` columns.
//!
//! # Example
//!
//! ```rust
//! use acton_data::repository::{column, Audit, Entity, TableSchema, Value};
//! use acton_data::error::DbResult;
//! use sqlx::any::AnyRow;
//!
//! #[derive(Debug, Clone, Default)]
//! struct Widget {
//!     id: Option<String>,
//!     name: String,
//!     audit: Audit,
//! }
//!
//! impl Entity for Widget {
//!     fn schema() -> TableSchema {
//!         TableSchema::new("widgets", "wdg", &["name"])
//!     }
//!     fn id(&self) -> Option<&str> {
//!         self.id.as_deref()
//!     }
//!     fn set_id(&mut self, id: String) {
//!         self.id = Some(id);
//!     }
//!     fn audit(&self) -> &Audit {
//!         &self.audit
//!     }
//!     fn audit_mut(&mut self) -> &mut Audit {
//!         &mut self.audit
//!     }
//!     fn to_values(&self) -> Vec<Value> {
//!         vec![self.name.clone().into()]
//!     }
//!     fn from_row(row: &AnyRow) -> DbResult<Self> {
//!         Ok(Self {
//!             id: Some(column(row, "id")?),
//!             name: column(row, "name")?,
//!             audit: Audit::from_row(row)?,
//!         })
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::{Any, Row};

use super::filter::Value;
use crate::classifier::Classify;
use crate::error::{DatabaseError, DbResult, ErrorKind};

/// Identifier column present on every table
pub const ID_COLUMN: &str = "id";

/// Audit columns present on every table, in statement order
pub const AUDIT_COLUMNS: [&str; 6] = [
    "created_at",
    "updated_at",
    "deleted_at",
    "created_by",
    "updated_by",
    "deleted_by",
];

/// A persistable record type
pub trait Entity: Send + Sync + Unpin + 'static {
    /// Table layout; called once per repository
    fn schema() -> TableSchema;

    /// Identifier, if one was assigned
    fn id(&self) -> Option<&str>;

    /// Assign the identifier; the repository only calls this on create
    fn set_id(&mut self, id: String);

    fn audit(&self) -> &Audit;

    fn audit_mut(&mut self) -> &mut Audit;

    /// Values of the data columns, in [`TableSchema::columns`] order
    fn to_values(&self) -> Vec<Value>;

    /// Decode a row selected with every schema column
    fn from_row(row: &AnyRow) -> DbResult<Self>
    where
        Self: Sized;
}

/// Table layout of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: String,
    /// TypeID prefix of generated identifiers
    pub id_prefix: String,
    /// Data columns, excluding `id` and the audit columns
    pub columns: Vec<String>,
    /// Reads skip rows whose `deleted_at` is set
    pub soft_delete: bool,
}

impl TableSchema {
    pub fn new(table: impl Into<String>, id_prefix: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            table: table.into(),
            id_prefix: id_prefix.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            soft_delete: false,
        }
    }

    #[must_use]
    pub fn with_soft_delete(mut self, enabled: bool) -> Self {
        self.soft_delete = enabled;
        self
    }

    /// `id`, data columns, then audit columns
    pub fn all_columns(&self) -> Vec<&str> {
        std::iter::once(ID_COLUMN)
            .chain(self.columns.iter().map(String::as_str))
            .chain(AUDIT_COLUMNS)
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        name == ID_COLUMN
            || AUDIT_COLUMNS.contains(&name)
            || self.columns.iter().any(|c| c == name)
    }

    /// Comma separated column list for SELECT
    pub(crate) fn select_list(&self) -> String {
        self.all_columns().join(", ")
    }
}

/// Creation, update and soft-delete bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Audit {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub deleted_by: Option<String>,
}

impl Default for Audit {
    fn default() -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            created_at: epoch,
            updated_at: epoch,
            deleted_at: None,
            created_by: None,
            updated_by: None,
            deleted_by: None,
        }
    }
}

impl Audit {
    pub fn mark_created(&mut self, at: DateTime<Utc>, actor: Option<&str>) {
        self.created_at = at;
        self.updated_at = at;
        self.deleted_at = None;
        self.created_by = actor.map(str::to_string);
        self.updated_by = self.created_by.clone();
        self.deleted_by = None;
    }

    pub fn mark_updated(&mut self, at: DateTime<Utc>, actor: Option<&str>) {
        self.updated_at = at;
        if actor.is_some() {
            self.updated_by = actor.map(str::to_string);
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Values in [`AUDIT_COLUMNS`] order
    pub fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Timestamp(self.created_at),
            Value::Timestamp(self.updated_at),
            self.deleted_at.into(),
            self.created_by.clone().into(),
            self.updated_by.clone().into(),
            self.deleted_by.clone().into(),
        ]
    }

    pub fn from_row(row: &AnyRow) -> DbResult<Self> {
        Ok(Self {
            created_at: millis_to_datetime("created_at", column(row, "created_at")?)?,
            updated_at: millis_to_datetime("updated_at", column(row, "updated_at")?)?,
            deleted_at: column::<Option<i64>>(row, "deleted_at")?
                .map(|ms| millis_to_datetime("deleted_at", ms))
                .transpose()?,
            created_by: column(row, "created_by")?,
            updated_by: column(row, "updated_by")?,
            deleted_by: column(row, "deleted_by")?,
        })
    }
}

/// Current time truncated to millisecond precision
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

fn millis_to_datetime(field: &str, millis: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        DatabaseError::new(
            ErrorKind::Query,
            "decode",
            format!("timestamp {} out of range", millis),
        )
        .with_field(field)
    })
}

/// Decode one column, classifying decode failures
pub fn column<'r, T>(row: &'r AnyRow, name: &str) -> DbResult<T>
where
    T: sqlx::Decode<'r, Any> + sqlx::Type<Any>,
{
    row.try_get::<T, _>(name)
        .map_err(|e| e.classify("decode").with_field(name))
}
