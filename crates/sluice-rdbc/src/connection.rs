//! Connection traits for sluice-rdbc
//!
//! The seam every vendor backend implements. The core never speaks a wire
//! protocol itself; it drives these traits with [`DriverValue`] arguments
//! and reads [`DriverValue`] rows back:
//! - Connection: statement execution, prepare, transactions
//! - PreparedStatement: a statement prepared once and executed many times
//! - Transaction: the same operations bound to one open transaction
//! - RowStream: a cursor over result rows with column metadata
//! - ConnectionFactory: opens connections for a dialect's driver

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;

use crate::driver::{ColumnTypeInfo, DriverValue};
use crate::error::Result;

/// A connection to a database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a query and open a cursor over its rows
    async fn query(&self, sql: &str, args: &[DriverValue]) -> Result<Box<dyn RowStream>>;

    /// Execute a statement, returning the affected row count
    async fn execute(&self, sql: &str, args: &[DriverValue]) -> Result<u64>;

    /// Prepare a statement for repeated execution
    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>>;

    /// Begin a transaction with the given options
    async fn begin(&self, opts: &TxOptions) -> Result<Box<dyn Transaction>>;

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// A prepared statement.
///
/// Bulk-load statements (e.g. PostgreSQL `COPY ... FROM STDIN`) buffer one
/// row per `execute` call and flush on a final `execute` with no arguments.
#[async_trait]
pub trait PreparedStatement: Send + Sync {
    /// Execute the prepared statement with given arguments
    async fn execute(&self, args: &[DriverValue]) -> Result<u64>;

    /// Get the SQL string
    fn sql(&self) -> &str;

    /// Release server-side resources held by the statement
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A database transaction
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Execute a query inside the transaction and open a cursor
    async fn query(&self, sql: &str, args: &[DriverValue]) -> Result<Box<dyn RowStream>>;

    /// Execute a statement inside the transaction
    async fn execute(&self, sql: &str, args: &[DriverValue]) -> Result<u64>;

    /// Prepare a statement bound to the transaction
    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Cursor over result rows
pub trait RowStream: Send {
    /// Metadata of the result columns, available before the first row
    fn columns(&self) -> &[ColumnTypeInfo];

    /// Get the next row, one driver value per column
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Vec<DriverValue>>>> + Send + '_>>;
}

/// Row stream backed by rows already in memory
pub struct VecRowStream {
    columns: Vec<ColumnTypeInfo>,
    rows: std::vec::IntoIter<Vec<DriverValue>>,
}

impl VecRowStream {
    /// Create a stream over the given rows
    pub fn new(columns: Vec<ColumnTypeInfo>, rows: Vec<Vec<DriverValue>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }
}

impl RowStream for VecRowStream {
    fn columns(&self) -> &[ColumnTypeInfo] {
        &self.columns
    }

    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Vec<DriverValue>>>> + Send + '_>> {
        Box::pin(async move { Ok(self.rows.next()) })
    }
}

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Read uncommitted - dirty reads possible
    ReadUncommitted,
    /// Read committed - no dirty reads (PostgreSQL default)
    ReadCommitted,
    /// Repeatable read - no non-repeatable reads (MySQL default)
    RepeatableRead,
    /// Serializable - full isolation
    Serializable,
}

impl IsolationLevel {
    /// Convert to SQL string for SET TRANSACTION / BEGIN statements
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

/// Options for opening a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// Isolation level; `None` keeps the server default
    pub isolation: Option<IsolationLevel>,
    /// Open a read-only transaction
    pub read_only: bool,
}

impl TxOptions {
    /// Set isolation level
    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    /// Mark the transaction read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Configuration for creating connections
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Connection string with credentials merged in
    pub url: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Application name (shown in pg_stat_activity, etc)
    pub application_name: Option<String>,
    /// Additional connection properties
    pub properties: std::collections::HashMap<String, String>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &redact_url(&self.url))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("application_name", &self.application_name)
            .field("properties", &self.properties)
            .finish()
    }
}

/// Replace the password of a URL with `***` so it can be logged
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_ms: 10_000,
            application_name: Some("sluice".into()),
            properties: std::collections::HashMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// Create configuration with just a URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Add a connection property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;

    /// Name of the underlying driver
    fn driver_name(&self) -> &'static str;
}
