//! Error classification
//!
//! Turns opaque driver failures into [`DatabaseError`]s. Structured sqlx
//! variants are inspected first; everything else falls through to an ordered
//! table of substring rules matched against the lower-cased error text.
//! The first matching rule wins and an unmatched error is
//! [`ErrorKind::Unknown`] and not retryable.
//!
//! # Example
//!
//! ```rust
//! use acton_data::classifier::ErrorClassifier;
//! use acton_data::error::ErrorKind;
//!
//! let classifier = ErrorClassifier::standard();
//! let error = classifier.classify_message("Connection refused (os error 111)", "create");
//! assert_eq!(error.kind, ErrorKind::Connection);
//! assert!(error.retryable);
//! ```

use once_cell::sync::Lazy;

use crate::error::{DatabaseError, ErrorKind};

/// One entry of the classification table
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    /// Lower-case substrings; any of them matching selects this rule
    pub patterns: Vec<String>,
    /// Kind assigned on match
    pub kind: ErrorKind,
    /// Retryability assigned on match
    pub retryable: bool,
}

impl ClassificationRule {
    pub fn new(patterns: &[&str], kind: ErrorKind, retryable: bool) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_lowercase()).collect(),
            kind,
            retryable,
        }
    }

    fn matches(&self, normalized: &str) -> bool {
        self.patterns.iter().any(|p| normalized.contains(p.as_str()))
    }
}

/// Ordered rule table mapping error text to an [`ErrorKind`]
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

static STANDARD: Lazy<ErrorClassifier> = Lazy::new(ErrorClassifier::new);

impl ErrorClassifier {
    /// Create a classifier with the standard rule table
    pub fn new() -> Self {
        Self {
            rules: vec![
                ClassificationRule::new(
                    &[
                        "connection refused",
                        "connection reset",
                        "broken pipe",
                        "pool is closed",
                        "too many connections",
                    ],
                    ErrorKind::Connection,
                    true,
                ),
                ClassificationRule::new(&["duplicate", "unique"], ErrorKind::Duplicate, false),
                ClassificationRule::new(&["deadlock"], ErrorKind::Deadlock, true),
                ClassificationRule::new(
                    &["timeout", "timed out", "deadline exceeded"],
                    ErrorKind::Timeout,
                    true,
                ),
                ClassificationRule::new(
                    &["constraint", "foreign key"],
                    ErrorKind::Constraint,
                    false,
                ),
                ClassificationRule::new(&["not found", "no rows"], ErrorKind::NotFound, false),
                ClassificationRule::new(
                    &["syntax error", "no such table", "no such column"],
                    ErrorKind::Query,
                    false,
                ),
                ClassificationRule::new(&["sql injection"], ErrorKind::Security, false),
            ],
        }
    }

    /// Shared classifier with the standard rule table
    pub fn standard() -> &'static Self {
        &STANDARD
    }

    /// Put a rule ahead of the standard ones
    #[must_use]
    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Classify a plain error message
    pub fn classify_message(&self, message: &str, operation: &str) -> DatabaseError {
        let normalized = message.to_lowercase();
        let (kind, retryable) = self
            .rules
            .iter()
            .find(|rule| rule.matches(&normalized))
            .map(|rule| (rule.kind, rule.retryable))
            .unwrap_or((ErrorKind::Unknown, false));

        DatabaseError::new(kind, operation, message)
            .with_retryable(retryable)
            .with_cause(message)
    }

    /// Classify a sqlx error, using structured information where available
    pub fn classify_sqlx(&self, err: &sqlx::Error, operation: &str) -> DatabaseError {
        use sqlx::Error as E;

        let text = err.to_string();
        let structured = |kind: ErrorKind, message: &str| {
            DatabaseError::new(kind, operation, message).with_cause(text.clone())
        };

        match err {
            E::RowNotFound => structured(ErrorKind::NotFound, "no rows returned"),
            E::PoolTimedOut => structured(
                ErrorKind::Timeout,
                "timed out acquiring a connection from the pool",
            ),
            E::PoolClosed => structured(ErrorKind::Connection, "connection pool is closed"),
            E::WorkerCrashed => structured(ErrorKind::Connection, "database worker crashed"),
            E::Io(_) | E::Tls(_) => structured(ErrorKind::Connection, &text),
            E::Configuration(_) => structured(ErrorKind::Configuration, &text),
            E::ColumnNotFound(_) | E::ColumnIndexOutOfBounds { .. } => {
                structured(ErrorKind::Query, &text)
            }
            E::Database(db_err) => {
                let code = db_err.code();
                let code = code.as_deref();
                let error = if db_err.is_unique_violation() {
                    structured(ErrorKind::Duplicate, db_err.message())
                } else if db_err.is_foreign_key_violation() || db_err.is_check_violation() {
                    structured(ErrorKind::Constraint, db_err.message())
                } else if matches!(code, Some("40P01") | Some("40001")) {
                    structured(ErrorKind::Deadlock, db_err.message())
                } else {
                    self.classify_message(db_err.message(), operation)
                        .with_cause(text.clone())
                };
                match db_err.table() {
                    Some(table) => error.with_table(table),
                    None => error,
                }
            }
            _ => self.classify_message(&text, operation),
        }
    }

    /// Classify the error of a result, leaving success untouched
    pub fn classify_result<T, E: Classify>(
        &self,
        result: Result<T, E>,
        operation: &str,
    ) -> Result<T, DatabaseError> {
        result.map_err(|e| e.classify(operation))
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Conversion of a failure into a [`DatabaseError`]
///
/// Implemented for the error types the crate sees at its seams. Already
/// classified errors pass through unchanged.
pub trait Classify {
    fn classify(self, operation: &str) -> DatabaseError;
}

impl Classify for DatabaseError {
    fn classify(self, operation: &str) -> DatabaseError {
        if self.operation.is_empty() {
            self.with_operation(operation)
        } else {
            self
        }
    }
}

impl Classify for sqlx::Error {
    fn classify(self, operation: &str) -> DatabaseError {
        ErrorClassifier::standard().classify_sqlx(&self, operation)
    }
}

impl Classify for std::io::Error {
    fn classify(self, operation: &str) -> DatabaseError {
        ErrorClassifier::standard()
            .classify_message(&self.to_string(), operation)
    }
}

impl Classify for tokio::time::error::Elapsed {
    fn classify(self, operation: &str) -> DatabaseError {
        DatabaseError::timeout(operation, "deadline exceeded").with_cause(self.to_string())
    }
}

impl Classify for String {
    fn classify(self, operation: &str) -> DatabaseError {
        ErrorClassifier::standard().classify_message(&self, operation)
    }
}

impl Classify for &str {
    fn classify(self, operation: &str) -> DatabaseError {
        ErrorClassifier::standard().classify_message(self, operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(message: &str) -> (ErrorKind, bool) {
        let error = ErrorClassifier::standard().classify_message(message, "test");
        (error.kind, error.retryable)
    }

    #[test]
    fn test_classify_standard_table() {
        assert_eq!(kind_of("dial tcp: Connection Refused"), (ErrorKind::Connection, true));
        assert_eq!(kind_of("ERROR: duplicate key value violates"), (ErrorKind::Duplicate, false));
        assert_eq!(kind_of("deadlock detected"), (ErrorKind::Deadlock, true));
        assert_eq!(kind_of("context deadline exceeded"), (ErrorKind::Timeout, true));
        assert_eq!(kind_of("statement timeout"), (ErrorKind::Timeout, true));
        assert_eq!(kind_of("violates foreign key"), (ErrorKind::Constraint, false));
        assert_eq!(kind_of("record not found"), (ErrorKind::NotFound, false));
        assert_eq!(kind_of("sql: no rows in result set"), (ErrorKind::NotFound, false));
        assert_eq!(kind_of("syntax error at or near \"SELEC\""), (ErrorKind::Query, false));
        assert_eq!(kind_of("possible SQL injection in column"), (ErrorKind::Security, false));
    }

    #[test]
    fn test_classify_unmatched_is_unknown() {
        assert_eq!(kind_of("something odd happened"), (ErrorKind::Unknown, false));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        // sqlite reports unique violations as "UNIQUE constraint failed"
        assert_eq!(
            kind_of("UNIQUE constraint failed: widgets.sku"),
            (ErrorKind::Duplicate, false)
        );
        assert_eq!(
            kind_of("FOREIGN KEY constraint failed"),
            (ErrorKind::Constraint, false)
        );
    }

    #[test]
    fn test_classification_keeps_context() {
        let error = ErrorClassifier::standard().classify_message("deadlock detected", "update");
        assert_eq!(error.operation, "update");
        assert_eq!(error.cause.as_deref(), Some("deadlock detected"));
    }

    #[test]
    fn test_custom_rule_takes_precedence() {
        let classifier = ErrorClassifier::new().with_rule(ClassificationRule::new(
            &["read-only transaction"],
            ErrorKind::Connection,
            true,
        ));
        let error = classifier.classify_message("cannot execute INSERT in a read-only transaction", "create");
        assert_eq!(error.kind, ErrorKind::Connection);
        assert_eq!(classifier.rules().len(), 9);
    }

    #[test]
    fn test_classify_sqlx_structured_variants() {
        let classifier = ErrorClassifier::standard();
        let error = classifier.classify_sqlx(&sqlx::Error::PoolTimedOut, "create");
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert!(error.retryable);

        let error = classifier.classify_sqlx(&sqlx::Error::RowNotFound, "find_first_by_id");
        assert_eq!(error.kind, ErrorKind::NotFound);

        let error = classifier.classify_sqlx(&sqlx::Error::PoolClosed, "count_all");
        assert_eq!(error.kind, ErrorKind::Connection);
    }

    #[test]
    fn test_classify_result_leaves_success_alone() {
        let ok: Result<i32, sqlx::Error> = Ok(7);
        assert_eq!(ErrorClassifier::standard().classify_result(ok, "count_all"), Ok(7));

        let err: Result<i32, &str> = Err("connection reset by peer");
        let classified = ErrorClassifier::standard()
            .classify_result(err, "count_all")
            .unwrap_err();
        assert_eq!(classified.kind, ErrorKind::Connection);
    }

    #[test]
    fn test_classified_error_passes_through() {
        let original = DatabaseError::invalid_argument("delete_by_conditions", "no conditions");
        let classified = original.clone().classify("ignored");
        assert_eq!(classified, original);
    }
}
