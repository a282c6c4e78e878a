//! Error taxonomy and classification.
//!
//! Every error that crosses the public API boundary is a [`WorkError`]
//! carrying a category assigned at wrap time. Categorization inspects the
//! originating error's SQLSTATE code, type, and message, in the order given
//! by [`classify`].

use std::fmt;
use std::sync::Arc;

/// Coarse classification of a failure, used to drive retry and to give
/// callers a stable, match-able signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transient,
    Connection,
    Timeout,
    Deadlock,
    Serialization,
    Constraint,
    Syntax,
    Unknown,
}

impl ErrorCategory {
    /// Whether the default retry predicate considers this category eligible.
    pub fn is_retryable_by_default(self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient
                | ErrorCategory::Connection
                | ErrorCategory::Timeout
                | ErrorCategory::Deadlock
                | ErrorCategory::Serialization
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Transient => "TRANSIENT",
            ErrorCategory::Connection => "CONNECTION",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::Deadlock => "DEADLOCK",
            ErrorCategory::Serialization => "SERIALIZATION",
            ErrorCategory::Constraint => "CONSTRAINT",
            ErrorCategory::Syntax => "SYNTAX",
            ErrorCategory::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// The canonical error value at the public API boundary: a message, a
/// category, and the original cause (kept for diagnostics, not consulted
/// again by internal rethrows).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} ({category})")]
pub struct WorkError {
    pub message: String,
    pub category: ErrorCategory,
    /// True for the fixed set of operational signals spec §7 names
    /// ("instance has been shut down", "circuit breaker is open", ...):
    /// always surfaced, never retried, regardless of `category`. A plain
    /// categorized error (e.g. a retry-exhaustion timeout) leaves this
    /// `false` so the default predicate still consults `category`.
    pub operational: bool,
    #[source]
    pub cause: Option<Arc<anyhow::Error>>,
}

impl WorkError {
    /// Construct an operational signal: always surfaced, never retried,
    /// with no underlying cause (spec §7's fixed message set).
    pub fn operational(message: impl Into<String>) -> Self {
        WorkError {
            message: message.into(),
            category: ErrorCategory::Unknown,
            operational: true,
            cause: None,
        }
    }

    /// Like [`WorkError::operational`], but with an explicit category —
    /// used by the circuit breaker, whose rejection carries a real category
    /// (spec §4.2: "tagged as a connection-class failure") but must never
    /// be retried.
    pub fn operational_with_category(message: impl Into<String>, category: ErrorCategory) -> Self {
        WorkError {
            message: message.into(),
            category,
            operational: true,
            cause: None,
        }
    }

    pub fn with_category(message: impl Into<String>, category: ErrorCategory) -> Self {
        WorkError {
            message: message.into(),
            category,
            operational: false,
            cause: None,
        }
    }
}

/// A minimal view over the fields the classifier inspects. Postgres errors
/// and arbitrary `anyhow::Error`s are both adapted into this shape by
/// [`classify_anyhow`]; tests exercise [`classify_fields`] directly.
struct ErrorFields<'a> {
    code: Option<&'a str>,
    type_name: Option<&'a str>,
    message: &'a str,
    sub_errors: &'a [ErrorFields<'a>],
}

/// Pure classification over the raw fields an error exposes. Rules, in
/// order, first match wins (spec §4.4).
fn classify_fields(fields: &ErrorFields<'_>) -> ErrorCategory {
    if let Some(first) = fields.sub_errors.first() {
        return classify_fields(first);
    }

    if let Some(code) = fields.code {
        match code {
            "40001" => return ErrorCategory::Serialization,
            "40P01" => return ErrorCategory::Deadlock,
            "ETIMEDOUT" | "57014" => return ErrorCategory::Timeout,
            "ECONNRESET" | "ECONNREFUSED" | "57P01" | "57P02" => return ErrorCategory::Connection,
            _ => {}
        }
        if let Some(prefix) = code.get(0..2) {
            match prefix {
                "23" => return ErrorCategory::Constraint,
                "42" => return ErrorCategory::Syntax,
                _ => {}
            }
        }
    }

    if fields.type_name == Some("SequelizeConnectionError") {
        return ErrorCategory::Connection;
    }

    let lower = fields.message.to_ascii_lowercase();
    if lower.contains("timeout") {
        return ErrorCategory::Timeout;
    }
    if lower.contains("connection") {
        return ErrorCategory::Connection;
    }
    if lower.contains("deadlock") {
        return ErrorCategory::Deadlock;
    }

    ErrorCategory::Unknown
}

/// Categorize a `tokio_postgres::Error`, pulling the SQLSTATE code out of
/// the embedded `DbError` when present.
pub fn classify_pg(err: &tokio_postgres::Error) -> ErrorCategory {
    let code = err.code().map(|s| s.code());
    let message = err.to_string();
    let fields = ErrorFields {
        code,
        type_name: None,
        message: &message,
        sub_errors: &[],
    };
    classify_fields(&fields)
}

/// A synthetic error carrying an explicit SQLSTATE-like code. Used by
/// in-memory fake backends (tests) to rig a specific failure category —
/// constraint violation, serialization failure, timeout, etc. — without a
/// live Postgres connection to produce a real `tokio_postgres::Error` from.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SimulatedDbError {
    pub code: Option<String>,
    pub message: String,
}

impl SimulatedDbError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        SimulatedDbError {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

/// Categorize an arbitrary error value. Downcasts to `tokio_postgres::Error`
/// when possible (the common case inside this crate); otherwise falls back
/// to message inspection, matching spec §4.4 rule 7.
pub fn classify(err: &anyhow::Error) -> ErrorCategory {
    if let Some(pg_err) = err.downcast_ref::<tokio_postgres::Error>() {
        return classify_pg(pg_err);
    }
    if let Some(deadpool_err) = err.downcast_ref::<deadpool_postgres::PoolError>() {
        return classify_deadpool(deadpool_err);
    }
    if let Some(sim) = err.downcast_ref::<SimulatedDbError>() {
        let fields = ErrorFields {
            code: sim.code.as_deref(),
            type_name: None,
            message: &sim.message,
            sub_errors: &[],
        };
        return classify_fields(&fields);
    }
    let message = err.to_string();
    let fields = ErrorFields {
        code: None,
        type_name: None,
        message: &message,
        sub_errors: &[],
    };
    classify_fields(&fields)
}

fn classify_deadpool(err: &deadpool_postgres::PoolError) -> ErrorCategory {
    match err {
        deadpool_postgres::PoolError::Backend(pg_err) => classify_pg(pg_err),
        deadpool_postgres::PoolError::Timeout(_) => ErrorCategory::Timeout,
        deadpool_postgres::PoolError::Closed => ErrorCategory::Connection,
        _ => ErrorCategory::Connection,
    }
}

/// Wrap an arbitrary error into the canonical [`WorkError`]. Idempotent:
/// wrapping an already-wrapped error returns it unchanged (spec §4.4,
/// §8's `Wrap(Wrap(e)) ≡ Wrap(e)` law).
pub fn wrap(err: anyhow::Error) -> WorkError {
    if let Some(existing) = err.downcast_ref::<WorkError>() {
        return existing.clone();
    }
    let category = classify(&err);
    let message = {
        let m = err.to_string();
        if m.is_empty() {
            "Unknown error".to_string()
        } else {
            m
        }
    };
    WorkError {
        message,
        category,
        operational: false,
        cause: Some(Arc::new(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields<'a>(code: Option<&'a str>, message: &'a str) -> ErrorFields<'a> {
        ErrorFields {
            code,
            type_name: None,
            message,
            sub_errors: &[],
        }
    }

    #[test]
    fn classifies_serialization_by_code() {
        assert_eq!(
            classify_fields(&fields(Some("40001"), "")),
            ErrorCategory::Serialization
        );
    }

    #[test]
    fn classifies_deadlock_by_code() {
        assert_eq!(
            classify_fields(&fields(Some("40P01"), "")),
            ErrorCategory::Deadlock
        );
    }

    #[test]
    fn classifies_timeout_by_code() {
        assert_eq!(
            classify_fields(&fields(Some("57014"), "")),
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify_fields(&fields(Some("ETIMEDOUT"), "")),
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn classifies_connection_by_code() {
        for code in ["ECONNRESET", "ECONNREFUSED", "57P01", "57P02"] {
            assert_eq!(
                classify_fields(&fields(Some(code), "")),
                ErrorCategory::Connection
            );
        }
    }

    #[test]
    fn classifies_constraint_and_syntax_by_prefix() {
        assert_eq!(
            classify_fields(&fields(Some("23505"), "")),
            ErrorCategory::Constraint
        );
        assert_eq!(
            classify_fields(&fields(Some("42601"), "")),
            ErrorCategory::Syntax
        );
    }

    #[test]
    fn classifies_by_message_when_no_code() {
        assert_eq!(
            classify_fields(&fields(None, "Connection timeout exceeded")),
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify_fields(&fields(None, "connection refused by peer")),
            ErrorCategory::Connection
        );
        assert_eq!(
            classify_fields(&fields(None, "deadlock detected")),
            ErrorCategory::Deadlock
        );
        assert_eq!(
            classify_fields(&fields(None, "something else entirely")),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn recurses_into_first_sub_error() {
        let inner = fields(Some("40001"), "serialization failure");
        let outer = ErrorFields {
            code: None,
            type_name: None,
            message: "aggregate error",
            sub_errors: std::slice::from_ref(&inner),
        };
        assert_eq!(classify_fields(&outer), ErrorCategory::Serialization);
    }

    #[test]
    fn wrap_is_idempotent() {
        let original = anyhow::anyhow!("connection reset");
        let wrapped = wrap(original);
        let category_before = wrapped.category;
        let rewrapped = wrap(anyhow::Error::new(wrapped.clone()));
        assert_eq!(rewrapped.message, wrapped.message);
        assert_eq!(rewrapped.category, category_before);
    }

    #[test]
    fn wrap_falls_back_to_unknown_error_message() {
        #[derive(Debug, thiserror::Error)]
        #[error("")]
        struct Empty;
        let wrapped = wrap(anyhow::Error::new(Empty));
        assert_eq!(wrapped.message, "Unknown error");
        assert_eq!(wrapped.category, ErrorCategory::Unknown);
    }
}
