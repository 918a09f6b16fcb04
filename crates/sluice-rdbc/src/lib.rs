//! # sluice-rdbc
//!
//! Relational database access core for the Sluice data-integration engine.
//!
//! Readers and writers of an ETL job use this crate to move records between
//! a relational database and the engine's portable record model.
//!
//! ## Features
//!
//! - **Portable values**: [`element::Column`] and [`element::Record`] carry
//!   values independent of any driver
//! - **Dialects**: a process-wide registry of database vendors, each
//!   providing sources, tables and fields with their own quoting, bind
//!   syntax and type mapping
//! - **Parameters**: SQL text and bind arguments for inserts, metadata queries,
//!   min/max bounds and split ranges
//! - **Execution**: streaming reads, batch and per-statement writes, with
//!   or without a transaction, all cancellable
//! - **Pooling**: lazily grown connection pools, shared between the readers
//!   of one job through a reference-counted map
//! - **Range splitting**: even partitioning of integer, string and time key
//!   ranges into parallel read ranges
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sluice_rdbc::prelude::*;
//!
//! let source = new_source("postgres", serde_json::json!({
//!     "url": "postgres://localhost:5432/warehouse",
//!     "username": "etl",
//!     "password": "secret",
//!     "pool": { "maxOpenConns": 8, "connMaxIdleTime": "30s" }
//! }))?;
//! let db = open_db(source).await?;
//!
//! let table = db.table(BaseTable::new("", "public", "orders"));
//! db.fetch_table(&table).await?;
//!
//! let config = SplitConfig::from_json(&serde_json::json!({"key": "id"}))?;
//! for param in db.split_query_params(&table, &config, 4, None).await? {
//!     db.fetch_record(&param, |record| Ok(println!("{record:?}")), &cancel)
//!         .await?;
//! }
//! db.release().await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL dialect via tokio-postgres (default)
//! - `full` - All dialects enabled

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod db;
pub mod dialect;
pub mod driver;
pub mod element;
pub mod error;
pub mod field;
pub mod param;
pub mod pool;
pub mod reuse;
pub mod source;
pub mod split;
pub mod table;

// Backend implementations (conditionally compiled)
#[cfg(feature = "postgres")]
pub mod postgres;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, ErrorContext, Result};

    // Value model
    pub use crate::driver::{ColumnTypeInfo, DriverValue};
    pub use crate::element::{Column, ColumnKind, ColumnValue, Record};
    pub use crate::field::{
        BaseField, DriverKind, Field, FieldType, Scanner, SemanticKind, Valuer,
    };

    // Connection traits and config
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, IsolationLevel, PreparedStatement,
        RowStream, Transaction, TxOptions,
    };

    // Pool types
    pub use crate::pool::{
        ConnectionPool, PoolConfig, PoolPolicy, PoolStats, PooledConnection,
        SimpleConnectionPool,
    };

    // Registry, sources and tables
    pub use crate::dialect::{dialect, register_dialect, Dialect};
    pub use crate::source::{new_source, BaseSource, Source};
    pub use crate::table::{
        BaseTable, ConfigSetter, ExecParamProvider, FieldAdder, FieldsFetcher, RetryJudger,
        Table,
    };

    // Parameters
    pub use crate::param::{
        BoundParam, InsertParam, Parameter, SplitQueryParam, TableQueryParam, MODE_INSERT,
    };

    // Execution, sharing and splitting
    pub use crate::db::Db;
    pub use crate::reuse::{open_db, ResourceMap, Shared};
    pub use crate::split::{SplitConfig, SplitRange, SplitType, TimeAccuracy};

    pub use tokio_util::sync::CancellationToken;
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _config = ConnectionConfig::new("postgres://localhost/test");
        let _opts = TxOptions::default().read_only();
        let _table = BaseTable::new("", "public", "orders");
        assert_eq!(MODE_INSERT, "insert");
    }

    #[test]
    fn test_error_types() {
        let err = Error::connection("test error");
        assert!(err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Connection);
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn test_builtin_dialect_registered() {
        assert!(dialect(crate::postgres::DIALECT_NAME).is_ok());
        assert!(crate::dialect::dialect_names().contains(&"postgres".to_owned()));
    }
}
