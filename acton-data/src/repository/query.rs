//! SQL rendering for repository statements
//!
//! Identifiers are checked against a strict pattern and the entity schema
//! before they are spliced into SQL; values always travel as `$n`
//! parameters, which both PostgreSQL and SQLite accept.

use once_cell::sync::Lazy;
use regex::Regex;

use super::entity::TableSchema;
use super::filter::{FilterCondition, FilterOperator, Value};
use crate::error::{DatabaseError, DbResult};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("invalid identifier regex"));

/// Refuse anything that is not a plain SQL identifier
pub(crate) fn validate_identifier(operation: &str, name: &str) -> DbResult<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(DatabaseError::security(
            operation,
            format!("refusing identifier '{}': possible sql injection", name),
        )
        .with_field(name.to_string()))
    }
}

/// Identifier check plus membership in the schema
pub(crate) fn validate_column(operation: &str, schema: &TableSchema, name: &str) -> DbResult<()> {
    validate_identifier(operation, name)?;
    if schema.has_column(name) {
        Ok(())
    } else {
        Err(DatabaseError::invalid_argument(
            operation,
            format!("unknown column '{}'", name),
        )
        .with_table(schema.table.clone())
        .with_field(name.to_string()))
    }
}

/// Check every name the schema itself carries
pub(crate) fn validate_schema(schema: &TableSchema) -> DbResult<()> {
    validate_identifier("new", &schema.table)?;
    for column in &schema.columns {
        validate_identifier("new", column)?;
    }
    Ok(())
}

/// Statement text with its positional parameters
#[derive(Debug, Default)]
pub(crate) struct SqlBuilder {
    sql: String,
    params: Vec<Value>,
}

impl SqlBuilder {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Append a placeholder; lists expand to comma separated placeholders
    pub fn push_param(&mut self, value: Value) -> &mut Self {
        match value {
            Value::TextList(values) => {
                self.push_list(values.into_iter().map(Value::Text));
            }
            Value::IntegerList(values) => {
                self.push_list(values.into_iter().map(Value::Integer));
            }
            scalar => {
                self.params.push(scalar);
                let placeholder = format!("${}", self.params.len());
                self.sql.push_str(&placeholder);
            }
        }
        self
    }

    fn push_list(&mut self, values: impl Iterator<Item = Value>) {
        for (index, value) in values.enumerate() {
            if index > 0 {
                self.sql.push_str(", ");
            }
            self.push_param(value);
        }
    }

    /// Append ` WHERE ...` for the conditions, if any
    ///
    /// With `exclude_deleted` a `deleted_at IS NULL` guard is ANDed in.
    pub fn push_where(
        &mut self,
        operation: &str,
        schema: &TableSchema,
        conditions: &[FilterCondition],
        exclude_deleted: bool,
    ) -> DbResult<&mut Self> {
        let mut first = true;
        let mut keyword = |builder: &mut Self| {
            builder.push(if first { " WHERE " } else { " AND " });
            first = false;
        };

        if exclude_deleted {
            keyword(self);
            self.push("deleted_at IS NULL");
        }

        for condition in conditions {
            validate_column(operation, schema, &condition.field)?;
            keyword(self);
            self.push_condition(condition);
        }
        Ok(self)
    }

    fn push_condition(&mut self, condition: &FilterCondition) {
        let field = condition.field.as_str();
        match (condition.operator, &condition.value) {
            (FilterOperator::IsNull, _) => {
                self.push(field).push(" IS NULL");
            }
            (FilterOperator::IsNotNull, _) => {
                self.push(field).push(" IS NOT NULL");
            }
            (FilterOperator::Equal, value) if value.is_null() => {
                self.push(field).push(" IS NULL");
            }
            (FilterOperator::NotEqual, value) if value.is_null() => {
                self.push(field).push(" IS NOT NULL");
            }
            (FilterOperator::In, value) if value.list_len() == Some(0) => {
                self.push("1 = 0");
            }
            (FilterOperator::In, value) if value.list_len().is_some() => {
                self.push(field).push(" IN (").push_param(value.clone()).push(")");
            }
            (op, value) => {
                // A scalar IN operand degrades to equality
                let op = if op == FilterOperator::In {
                    FilterOperator::Equal
                } else {
                    op
                };
                self.push(field)
                    .push(" ")
                    .push(&op.to_string())
                    .push(" ")
                    .push_param(value.clone());
            }
        }
    }

    pub fn finish(self) -> (String, Vec<Value>) {
        (self.sql, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn schema() -> TableSchema {
        TableSchema::new("widgets", "wdg", &["name", "quantity", "sku"])
    }

    #[test]
    fn test_where_renders_conditions_in_order() {
        let mut builder = SqlBuilder::new("SELECT id FROM widgets");
        builder
            .push_where(
                "find",
                &schema(),
                &[
                    FilterCondition::eq("name", "gear"),
                    FilterCondition::gte("quantity", 3_i64),
                ],
                false,
            )
            .unwrap();
        let (sql, params) = builder.finish();

        assert_eq!(sql, "SELECT id FROM widgets WHERE name = $1 AND quantity >= $2");
        assert_eq!(params, vec![Value::Text("gear".into()), Value::Integer(3)]);
    }

    #[test]
    fn test_where_with_soft_delete_guard() {
        let mut builder = SqlBuilder::new("SELECT COUNT(*) FROM widgets");
        builder.push_where("count", &schema(), &[], true).unwrap();
        let (sql, params) = builder.finish();
        assert_eq!(sql, "SELECT COUNT(*) FROM widgets WHERE deleted_at IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn test_in_list_expands_placeholders() {
        let mut builder = SqlBuilder::new("DELETE FROM widgets");
        builder
            .push_where(
                "delete",
                &schema(),
                &[FilterCondition::in_strings("sku", vec!["a".into(), "b".into()])],
                false,
            )
            .unwrap();
        let (sql, params) = builder.finish();
        assert_eq!(sql, "DELETE FROM widgets WHERE sku IN ($1, $2)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_empty_in_list_matches_nothing() {
        let mut builder = SqlBuilder::new("SELECT id FROM widgets");
        builder
            .push_where("find", &schema(), &[FilterCondition::in_integers("quantity", vec![])], false)
            .unwrap();
        assert_eq!(builder.finish().0, "SELECT id FROM widgets WHERE 1 = 0");
    }

    #[test]
    fn test_null_equality_renders_is_null() {
        let mut builder = SqlBuilder::new("SELECT id FROM widgets");
        builder
            .push_where(
                "find",
                &schema(),
                &[
                    FilterCondition::eq("sku", None::<String>),
                    FilterCondition::ne("name", Value::Null),
                ],
                false,
            )
            .unwrap();
        let (sql, params) = builder.finish();
        assert_eq!(sql, "SELECT id FROM widgets WHERE sku IS NULL AND name IS NOT NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn test_injection_attempt_is_security_error() {
        let mut builder = SqlBuilder::new("SELECT id FROM widgets");
        let error = builder
            .push_where(
                "find",
                &schema(),
                &[FilterCondition::eq("name; DROP TABLE widgets", "x")],
                false,
            )
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Security);
    }

    #[test]
    fn test_unknown_column_is_invalid_argument() {
        let error = validate_column("find", &schema(), "price").unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidArgument);
        assert_eq!(error.table.as_deref(), Some("widgets"));
    }

    #[test]
    fn test_schema_validation() {
        assert!(validate_schema(&schema()).is_ok());
        let bad = TableSchema::new("widgets--", "wdg", &["name"]);
        assert_eq!(validate_schema(&bad).unwrap_err().kind, ErrorKind::Security);
    }
}
