//! Generic repository over sqlx's `Any` driver
//!
//! # Features
//!
//! - **CRUD**: [`Repository`] create, find, update, upsert and delete for any [`Entity`]
//! - **Pagination**: offset pages ([`Pagination`]) and opaque cursors ([`Cursor`])
//! - **Batches**: chunked inserts and cursor-driven batch reads
//! - **Transactions**: scoped, nestable, rolled back on error, panic, timeout or cancellation
//! - **Filtering**: [`FilterCondition`] rendered with validated identifiers
//! - **Validation**: optional [`Validator`] run before writes
//! - **Soft delete**: opt-in per table through [`TableSchema::with_soft_delete`]

mod entity;
mod filter;
mod generic;
mod handle;
mod pagination;
mod query;
mod validation;

pub use entity::{column, now_millis, Audit, Entity, TableSchema, AUDIT_COLUMNS, ID_COLUMN};
pub use filter::{FilterCondition, FilterOperator, Value};
pub use generic::Repository;
pub use handle::{DbHandle, TxHandle};
pub use pagination::{Cursor, CursorDirection, CursorPage, OrderDirection, Pagination};
pub use validation::{FieldError, ValidationResult, Validator};
