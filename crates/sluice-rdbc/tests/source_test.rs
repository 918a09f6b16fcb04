//! Tests for the dialect registry and sources

mod common;

use common::{mock_factory, Backend, MockTable};
use sluice_rdbc::dialect::dialect_names;
use sluice_rdbc::prelude::*;
use sluice_rdbc::source::ConnectConfig;
use std::sync::Arc;

/// A dialect whose sources talk to an in-memory backend
struct MockDialect;

struct PlainSource {
    base: BaseSource,
}

impl Source for PlainSource {
    fn config(&self) -> &serde_json::Value {
        self.base.config()
    }

    fn key(&self) -> &str {
        self.base.key()
    }

    fn driver_name(&self) -> &str {
        "mock"
    }

    fn connection_factory(&self) -> Arc<dyn ConnectionFactory> {
        mock_factory(&Backend::new())
    }

    fn table(&self, base: BaseTable) -> Arc<dyn Table> {
        Arc::new(MockTable::new(base))
    }
}

impl Dialect for MockDialect {
    fn source(&self, config: serde_json::Value) -> Result<Arc<dyn Source>> {
        Ok(Arc::new(PlainSource {
            base: BaseSource::new(config)?,
        }))
    }
}

// ==================== Registry ====================

#[test]
fn test_register_and_build_source() {
    register_dialect("mock-build", Arc::new(MockDialect));
    assert!(dialect_names().contains(&"mock-build".to_owned()));

    let source = new_source(
        "mock-build",
        serde_json::json!({"url": "mock://h/db", "username": "u", "password": "p"}),
    )
    .unwrap();
    assert_eq!(source.driver_name(), "mock");
    assert_eq!(source.key(), "mock://u:p@h/db");
    assert_eq!(source.connect_name(), "mock://u:***@h/db");
    assert_eq!(source.connection_config().url, source.key());
}

#[test]
#[should_panic(expected = "already registered")]
fn test_duplicate_registration_panics() {
    register_dialect("mock-dup", Arc::new(MockDialect));
    register_dialect("mock-dup", Arc::new(MockDialect));
}

#[test]
fn test_unknown_dialect_is_config_error() {
    let err = new_source("no-such-db", serde_json::json!({"url": "x://h"})).err().unwrap();
    assert!(matches!(err, Error::Configuration { .. }));
    assert!(dialect("no-such-db").is_err());
}

#[test]
fn test_source_config_errors() {
    register_dialect("mock-config", Arc::new(MockDialect));
    let missing = new_source("mock-config", serde_json::json!({"username": "u"}));
    assert!(matches!(missing.err().unwrap(), Error::Configuration { .. }));

    let not_a_url = new_source("mock-config", serde_json::json!({"url": "not a url"}));
    assert!(matches!(not_a_url.err().unwrap(), Error::Configuration { .. }));

    let wrong_type = new_source("mock-config", serde_json::json!({"url": 5}));
    assert!(matches!(wrong_type.err().unwrap(), Error::Configuration { .. }));
}

#[test]
fn test_source_wraps_tables_in_dialect_type() {
    register_dialect("mock-table", Arc::new(MockDialect));
    let source = new_source("mock-table", serde_json::json!({"url": "mock://h/db"})).unwrap();
    let table = source.table(BaseTable::new("db", "s", "t"));
    assert_eq!(table.quoted(), "db.s.t");
    assert!(table.as_field_adder().is_some());
}

// ==================== ConnectConfig ====================

#[test]
fn test_connect_config_debug_hides_password() {
    let config = ConnectConfig::from_json(&serde_json::json!({
        "url": "postgres://h/db",
        "username": "etl",
        "password": "hunter2"
    }))
    .unwrap();
    let debug = format!("{config:?}");
    assert!(debug.contains("etl"));
    assert!(!debug.contains("hunter2"));
}

#[cfg(feature = "postgres")]
#[test]
fn test_postgres_dialect_builtin() {
    let source = new_source(
        "postgres",
        serde_json::json!({"url": "postgres://localhost:5432/etl", "username": "etl", "password": "pw"}),
    )
    .unwrap();
    assert_eq!(source.driver_name(), "postgres");

    let table = source.table(BaseTable::new("etl", "public", "orders"));
    assert_eq!(table.quoted(), "\"public\".\"orders\"");
    assert!(table.as_exec_param_provider().is_some());
    assert!(table.as_retry_judger().is_some());
}
