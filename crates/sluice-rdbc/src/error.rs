//! Error types for sluice-rdbc
//!
//! Errors are classified so that callers (the job layer, table retry
//! judgers) can decide what to do with them:
//! - Retriable errors (connection, timeout, deadlock, pool exhaustion)
//! - Non-retriable errors (decode failures, constraint violations, bad config)
//!
//! The execution engine never retries by itself; it wraps failures with the
//! operation name and SQL text through [`ErrorContext`] and returns them.

use std::fmt;
use thiserror::Error;

/// Result type for sluice-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable)
    Connection,
    /// Query execution errors
    Query,
    /// Transaction errors
    Transaction,
    /// Constraint violation (not retriable)
    Constraint,
    /// Value decode/encode errors (not retriable)
    TypeConversion,
    /// Timeout errors (retriable)
    Timeout,
    /// Deadlock detected (retriable)
    Deadlock,
    /// Configuration error
    Configuration,
    /// Pool exhausted (retriable with backoff)
    PoolExhausted,
    /// Range split errors
    Partition,
    /// Schema-related errors
    Schema,
    /// Operation cancelled by the caller
    Cancelled,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::Deadlock | Self::PoolExhausted
        )
    }
}

/// Main error type for sluice-rdbc
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transaction error
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Constraint violation (PK, FK, unique, check)
    #[error("constraint violation: {message}")]
    Constraint { message: String },

    /// A value could not be decoded from or encoded to the driver
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Deadlock detected
    #[error("deadlock detected")]
    Deadlock,

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Connection pool exhausted
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Range split failed
    #[error("split error: {message}")]
    Partition { message: String },

    /// Schema error (unsupported column type, missing capability)
    #[error("schema error: {message}")]
    Schema { message: String },

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Unsupported operation for this dialect
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// An engine operation failed; carries the operation name and SQL text
    #[error("{op} failed{}: {source}", .sql.as_deref().map(|s| format!(" (sql: {s})")).unwrap_or_default())]
    Operation {
        op: &'static str,
        sql: Option<String>,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Constraint { .. } => ErrorCategory::Constraint,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Deadlock => ErrorCategory::Deadlock,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Partition { .. } => ErrorCategory::Partition,
            Self::Schema { .. } => ErrorCategory::Schema,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Unsupported { .. } => ErrorCategory::Other,
            Self::Operation { source, .. } => source.category(),
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Strip [`Error::Operation`] wrappers and return the underlying error
    pub fn root(&self) -> &Error {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// SQL text attached to this error, innermost first
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Operation { sql, source, .. } => source.sql().or(sql.as_deref()),
            Self::Query { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create a constraint violation error
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a decode/encode error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a range split error
    pub fn partition(message: impl Into<String>) -> Self {
        Self::Partition {
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }
}

/// Attach operation name and SQL text to a failing result
pub trait ErrorContext<T> {
    /// Wrap the error in [`Error::Operation`]
    fn op(self, op: &'static str, sql: Option<&str>) -> Result<T>;
}

impl<T> ErrorContext<T> for Result<T> {
    fn op(self, op: &'static str, sql: Option<&str>) -> Result<T> {
        self.map_err(|e| Error::Operation {
            op,
            sql: sql.map(str::to_owned),
            source: Box::new(e),
        })
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::Constraint => write!(f, "constraint"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Timeout => write!(f, "timeout"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::Configuration => write!(f, "configuration"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Partition => write!(f, "partition"),
            Self::Schema => write!(f, "schema"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Other => write!(f, "other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::Connection.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());
        assert!(ErrorCategory::Deadlock.is_retriable());
        assert!(ErrorCategory::PoolExhausted.is_retriable());

        assert!(!ErrorCategory::Constraint.is_retriable());
        assert!(!ErrorCategory::TypeConversion.is_retriable());
        assert!(!ErrorCategory::Partition.is_retriable());
        assert!(!ErrorCategory::Cancelled.is_retriable());
    }

    #[test]
    fn test_operation_wrapper_keeps_category() {
        let res: Result<()> = Err(Error::connection("refused"));
        let err = res.op("BatchExec", Some("insert into t(a) values($1)")).unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Connection);
        assert!(err.is_retriable());
        assert_eq!(err.sql(), Some("insert into t(a) values($1)"));
        assert!(matches!(err.root(), Error::Connection { .. }));
    }

    #[test]
    fn test_operation_display() {
        let res: Result<()> = Err(Error::type_conversion("overflow"));
        let err = res.op("FetchRecord", Some("select 1")).unwrap_err();
        let text = err.to_string();

        assert!(text.starts_with("FetchRecord failed"));
        assert!(text.contains("select 1"));
        assert!(text.contains("overflow"));

        let res: Result<()> = Err(Error::Cancelled);
        let err = res.op("FetchRecord", None).unwrap_err();
        assert_eq!(err.to_string(), "FetchRecord failed: operation cancelled");
    }

    #[test]
    fn test_inner_sql_wins() {
        let res: Result<()> = Err(Error::query_with_sql("syntax", "select * form t"));
        let err = res.op("FetchRecord", Some("outer")).unwrap_err();
        assert_eq!(err.sql(), Some("select * form t"));
    }
}
