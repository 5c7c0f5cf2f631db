//! Entity validation hook

use async_trait::async_trait;
use std::fmt;

use crate::error::DatabaseError;

/// A single failed rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Outcome of validating one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn from_errors(errors: Vec<FieldError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Convert a failed result into a `Validation` error
    ///
    /// The first offending field is attached to the error.
    pub fn into_error(self, operation: &str, table: &str) -> Option<DatabaseError> {
        if self.valid {
            return None;
        }
        let message = if self.errors.is_empty() {
            "entity failed validation".to_string()
        } else {
            self.errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        };
        let error = DatabaseError::validation(operation, message).with_table(table);
        Some(match self.errors.first() {
            Some(first) => error.with_field(first.field.clone()),
            None => error,
        })
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::ok()
    }
}

/// Validates entities before they are written
#[async_trait]
pub trait Validator<T>: Send + Sync {
    async fn validate(&self, entity: &T) -> ValidationResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct NonEmptyName;

    #[async_trait]
    impl Validator<String> for NonEmptyName {
        async fn validate(&self, name: &String) -> ValidationResult {
            if name.trim().is_empty() {
                ValidationResult::from_errors(vec![FieldError::new("name", "must not be blank")])
            } else {
                ValidationResult::ok()
            }
        }
    }

    #[tokio::test]
    async fn test_validator_reports_field_errors() {
        let result = NonEmptyName.validate(&"  ".to_string()).await;
        assert!(!result.valid);
        assert_eq!(result.errors[0].field, "name");

        assert!(NonEmptyName.validate(&"gear".to_string()).await.valid);
    }

    #[test]
    fn test_into_error() {
        let result = ValidationResult::from_errors(vec![
            FieldError::new("name", "must not be blank"),
            FieldError::new("quantity", "must be positive"),
        ]);
        let error = result.into_error("create", "widgets").unwrap();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(error.field.as_deref(), Some("name"));
        assert!(error.message.contains("quantity: must be positive"));

        assert!(ValidationResult::ok().into_error("create", "widgets").is_none());
    }
}
