//! Error types for the Quereus engine.
//!
//! All public APIs return `QuereusResult<T>`; no panics in library code.

use thiserror::Error;

/// Unified error type for all Quereus operations.
///
/// Variants follow the engine's error taxonomy; [`QuereusError::code`] maps
/// each variant onto the numeric-style result codes exposed to hosts.
#[derive(Debug, Error)]
pub enum QuereusError {
    /// API used in a forbidden state (write outside a transaction, closed store, …)
    #[error("misuse: {0}")]
    Misuse(String),

    /// SQL syntax error
    #[error("parse error: {message}\nSQL: {sql}")]
    Parse { message: String, sql: String },

    /// Unknown table, column, function or collation name
    #[error("cannot resolve {kind} '{name}'")]
    Resolve { kind: &'static str, name: String },

    /// Incompatible types in an expression or key encoding
    #[error("type error: {0}")]
    Type(String),

    /// Constraint violation (PK, NOT NULL, CHECK)
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Catalog lookup failure (missing savepoint, missing schema object)
    #[error("not found: {0}")]
    NotFound(String),

    /// Write attempted against a read-only target
    #[error("readonly: {0}")]
    Readonly(String),

    /// Failure propagated from the backing key/value store
    #[error("io error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Feature the engine does not implement
    #[error("not supported: {feature}")]
    Unsupported { feature: String },

    /// Invariant violation; the presence of this error is a bug
    #[error("internal error: {0}")]
    Internal(String),

    /// Engine error with no narrower taxonomy kind (maps to the generic
    /// ERROR result code)
    #[error("{0}")]
    General(String),
}

/// Result type alias for all Quereus operations.
pub type QuereusResult<T> = Result<T, QuereusError>;

/// Result codes surfaced to embedding hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    Error,
    Misuse,
    Constraint,
    NotFound,
    Readonly,
    Internal,
    Unsupported,
}

impl QuereusError {
    /// Map this error onto its host-visible result code.
    pub fn code(&self) -> ErrorCode {
        match self {
            QuereusError::Misuse(_) => ErrorCode::Misuse,
            QuereusError::Constraint(_) => ErrorCode::Constraint,
            QuereusError::NotFound(_) => ErrorCode::NotFound,
            QuereusError::Readonly(_) => ErrorCode::Readonly,
            QuereusError::Internal(_) => ErrorCode::Internal,
            QuereusError::Unsupported { .. } => ErrorCode::Unsupported,
            _ => ErrorCode::Error,
        }
    }

    /// Shorthand for an I/O error without an underlying cause.
    pub fn io(message: impl Into<String>) -> Self {
        QuereusError::Io {
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for an I/O error wrapping a store-level cause.
    pub fn io_caused(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        QuereusError::Io {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn unsupported(feature: impl Into<String>) -> Self {
        QuereusError::Unsupported {
            feature: feature.into(),
        }
    }
}

impl From<std::io::Error> for QuereusError {
    fn from(err: std::io::Error) -> Self {
        QuereusError::Io {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Render an error with its full cause chain, one cause per line.
pub fn format_error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut cause = err.source();
    while let Some(inner) = cause {
        out.push_str("\n  caused by: ");
        out.push_str(&inner.to_string());
        cause = inner.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_misuse() {
        let err = QuereusError::Misuse("write outside transaction".to_string());
        assert_eq!(err.to_string(), "misuse: write outside transaction");
    }

    #[test]
    fn error_display_resolve() {
        let err = QuereusError::Resolve {
            kind: "table",
            name: "users".to_string(),
        };
        assert_eq!(err.to_string(), "cannot resolve table 'users'");
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(
            QuereusError::Constraint("pk".into()).code(),
            ErrorCode::Constraint
        );
        assert_eq!(QuereusError::NotFound("x".into()).code(), ErrorCode::NotFound);
        assert_eq!(QuereusError::io("disk").code(), ErrorCode::Error);
        assert_eq!(
            QuereusError::Internal("bug".into()).code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn chain_formatting_includes_causes() {
        let inner = std::io::Error::other("device gone");
        let err = QuereusError::io_caused("flush failed", inner);
        let chain = format_error_chain(&err);
        assert!(chain.contains("flush failed"));
        assert!(chain.contains("device gone"));
    }
}
