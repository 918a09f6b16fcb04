//! In-memory backend shared by the integration tests
//!
//! The backend logs every statement it sees so tests can assert what
//! reached the "database", including BEGIN/COMMIT/ROLLBACK.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_rdbc::prelude::*;
use sluice_rdbc::connection::VecRowStream;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("sluice_rdbc=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Canned result for queries whose SQL contains `fragment`
struct Response {
    fragment: String,
    columns: Vec<ColumnTypeInfo>,
    rows: Vec<Vec<DriverValue>>,
}

#[derive(Default)]
pub struct Backend {
    log: Mutex<Vec<String>>,
    responses: Mutex<Vec<Response>>,
    fail_on: Mutex<Option<String>>,
    stall_on: Mutex<Option<String>>,
    fail_rollback: AtomicBool,
    affected: AtomicU64,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Backend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            affected: AtomicU64::new(1),
            ..Default::default()
        })
    }

    pub fn respond(&self, fragment: &str, columns: Vec<ColumnTypeInfo>, rows: Vec<Vec<DriverValue>>) {
        self.responses.lock().push(Response {
            fragment: fragment.to_owned(),
            columns,
            rows,
        });
    }

    /// Make statements containing `fragment` fail with a constraint error
    pub fn fail_on(&self, fragment: &str) {
        *self.fail_on.lock() = Some(fragment.to_owned());
    }

    /// Make queries containing `fragment` hang forever
    pub fn stall_on(&self, fragment: &str) {
        *self.stall_on.lock() = Some(fragment.to_owned());
    }

    /// Make every ROLLBACK fail, as if the link dropped
    pub fn fail_rollback(&self) {
        self.fail_rollback.store(true, Ordering::Relaxed);
    }

    pub fn set_affected(&self, n: u64) {
        self.affected.store(n, Ordering::Relaxed);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.log.lock().iter().any(|e| e == entry)
    }

    fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }

    fn check(&self, sql: &str) -> Result<()> {
        match self.fail_on.lock().as_deref() {
            Some(fragment) if sql.contains(fragment) => {
                Err(Error::constraint(format!("rejected {sql}")))
            }
            _ => Ok(()),
        }
    }

    async fn stall(&self, sql: &str) {
        let stalls = matches!(self.stall_on.lock().as_deref(), Some(f) if sql.contains(f));
        if stalls {
            std::future::pending::<()>().await;
        }
    }

    fn query(&self, sql: &str, args: &[DriverValue]) -> Result<Box<dyn RowStream>> {
        self.record(format!("QUERY {sql} {}", args.len()));
        self.check(sql)?;
        let responses = self.responses.lock();
        let response = responses
            .iter()
            .find(|r| sql.contains(&r.fragment))
            .ok_or_else(|| Error::query_with_sql("no canned response", sql))?;
        Ok(Box::new(VecRowStream::new(
            response.columns.clone(),
            response.rows.clone(),
        )))
    }

    fn execute(&self, sql: &str, args: &[DriverValue]) -> Result<u64> {
        self.record(format!("EXEC {sql} {}", args.len()));
        self.check(sql)?;
        Ok(self.affected.load(Ordering::Relaxed))
    }
}

pub struct MockConnection {
    backend: Arc<Backend>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, sql: &str, args: &[DriverValue]) -> Result<Box<dyn RowStream>> {
        self.backend.stall(sql).await;
        self.backend.query(sql, args)
    }

    async fn execute(&self, sql: &str, args: &[DriverValue]) -> Result<u64> {
        self.backend.execute(sql, args)
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.backend.record(format!("PREPARE {sql}"));
        Ok(Box::new(MockStatement {
            backend: self.backend.clone(),
            sql: sql.to_owned(),
        }))
    }

    async fn begin(&self, opts: &TxOptions) -> Result<Box<dyn Transaction>> {
        let entry = if opts.read_only { "BEGIN READ ONLY" } else { "BEGIN" };
        self.backend.record(entry.to_owned());
        Ok(Box::new(MockTransaction {
            backend: self.backend.clone(),
        }))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        self.backend.closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

pub struct MockTransaction {
    backend: Arc<Backend>,
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn query(&self, sql: &str, args: &[DriverValue]) -> Result<Box<dyn RowStream>> {
        self.backend.stall(sql).await;
        self.backend.query(sql, args)
    }

    async fn execute(&self, sql: &str, args: &[DriverValue]) -> Result<u64> {
        self.backend.execute(sql, args)
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.backend.record(format!("PREPARE {sql}"));
        Ok(Box::new(MockStatement {
            backend: self.backend.clone(),
            sql: sql.to_owned(),
        }))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.backend.record("COMMIT".to_owned());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.backend.record("ROLLBACK".to_owned());
        if self.backend.fail_rollback.load(Ordering::Relaxed) {
            return Err(Error::connection("link dropped during rollback"));
        }
        Ok(())
    }
}

pub struct MockStatement {
    backend: Arc<Backend>,
    sql: String,
}

#[async_trait]
impl PreparedStatement for MockStatement {
    async fn execute(&self, args: &[DriverValue]) -> Result<u64> {
        self.backend.record(format!("STMT {}", args.len()));
        self.backend.check(&self.sql)?;
        Ok(if args.is_empty() { 0 } else { 1 })
    }

    fn sql(&self) -> &str {
        &self.sql
    }

    async fn close(&self) -> Result<()> {
        self.backend.record("STMT CLOSE".to_owned());
        Ok(())
    }
}

pub struct MockFactory {
    backend: Arc<Backend>,
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        self.backend.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockConnection {
            backend: self.backend.clone(),
        }))
    }

    fn driver_name(&self) -> &'static str {
        "mock"
    }
}

/// Driver kinds understood by the mock dialect
pub fn mock_kind(type_name: &str) -> Option<DriverKind> {
    match type_name {
        "BOOL" => Some(DriverKind::Bool),
        "INT4" => Some(DriverKind::Int32),
        "INT8" => Some(DriverKind::Int64),
        "NUMERIC" => Some(DriverKind::Decimal),
        "TEXT" => Some(DriverKind::Text),
        "TIMESTAMP" => Some(DriverKind::Timestamp),
        _ => None,
    }
}

#[derive(Debug)]
pub struct MockField {
    base: BaseField,
}

impl MockField {
    pub fn new(index: usize, name: &str, type_name: &str) -> Self {
        Self {
            base: BaseField::new(index, name, ColumnTypeInfo::new(name, type_name)),
        }
    }

    fn driver_kind(&self) -> Result<DriverKind> {
        mock_kind(&self.base.type_info().database_type_name)
            .ok_or_else(|| Error::type_conversion("unsupported mock type"))
    }
}

impl FieldType for MockField {
    fn database_type_name(&self) -> &str {
        &self.base.type_info().database_type_name
    }

    fn kind(&self) -> SemanticKind {
        mock_kind(self.database_type_name()).map_or(SemanticKind::Unsupported, DriverKind::semantic_kind)
    }
}

impl Scanner for MockField {
    fn scan(&self, raw: DriverValue) -> Result<Column> {
        self.driver_kind()?.decode(self.base.name(), raw)
    }
}

impl Valuer for MockField {
    fn value(&self, column: &Column) -> Result<DriverValue> {
        self.driver_kind()?.encode(column)
    }
}

impl Field for MockField {
    fn index(&self) -> usize {
        self.base.index()
    }

    fn name(&self) -> &str {
        self.base.name()
    }

    fn quoted(&self) -> String {
        self.base.name().to_owned()
    }

    fn bind_var(&self, i: usize) -> String {
        format!("${i}")
    }

    fn field_type(&self) -> &dyn FieldType {
        self
    }

    fn scanner(&self) -> &dyn Scanner {
        self
    }

    fn valuer(&self) -> &dyn Valuer {
        self
    }
}

#[derive(Debug)]
pub struct MockTable {
    base: BaseTable,
}

impl MockTable {
    pub fn new(base: BaseTable) -> Self {
        Self { base }
    }
}

impl Table for MockTable {
    fn instance(&self) -> &str {
        self.base.instance()
    }

    fn schema(&self) -> &str {
        self.base.schema()
    }

    fn name(&self) -> &str {
        self.base.name()
    }

    fn fields(&self) -> Vec<Arc<dyn Field>> {
        self.base.fields()
    }

    fn as_field_adder(&self) -> Option<&dyn FieldAdder> {
        Some(self)
    }
}

impl FieldAdder for MockTable {
    fn add_field(&self, base: BaseField) -> Result<()> {
        let field = MockField { base };
        self.base.append_field(Arc::new(field))
    }

    fn clear_fields(&self) {
        self.base.clear_fields();
    }
}

pub struct MockSource {
    base: BaseSource,
    backend: Arc<Backend>,
}

impl Source for MockSource {
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
        Arc::new(MockFactory {
            backend: self.backend.clone(),
        })
    }

    fn table(&self, base: BaseTable) -> Arc<dyn Table> {
        Arc::new(MockTable::new(base))
    }
}

pub fn mock_source(url: &str, backend: &Arc<Backend>) -> Arc<dyn Source> {
    let base = BaseSource::new(serde_json::json!({
        "url": url,
        "username": "etl",
        "password": "secret",
        "pool": {"maxOpenConns": 2, "maxIdleConns": 1}
    }))
    .unwrap();
    Arc::new(MockSource {
        base,
        backend: backend.clone(),
    })
}

/// A table with fields `id INT8, name TEXT`, already discovered
pub fn orders_table(db: &Db) -> Arc<dyn Table> {
    let table = db.table(BaseTable::new("", "public", "orders"));
    let adder = table.as_field_adder().unwrap();
    adder
        .add_field(BaseField::new(0, "id", ColumnTypeInfo::new("id", "INT8")))
        .unwrap();
    adder
        .add_field(BaseField::new(1, "name", ColumnTypeInfo::new("name", "TEXT")))
        .unwrap();
    table
}

pub fn order(id: i64, name: &str) -> Record {
    [Column::bigint("id", id), Column::string("name", name)]
        .into_iter()
        .collect()
}

pub fn orders_columns() -> Vec<ColumnTypeInfo> {
    vec![
        ColumnTypeInfo::new("id", "INT8"),
        ColumnTypeInfo::new("name", "TEXT"),
    ]
}

pub fn mock_factory(backend: &Arc<Backend>) -> Arc<dyn ConnectionFactory> {
    Arc::new(MockFactory {
        backend: backend.clone(),
    })
}
