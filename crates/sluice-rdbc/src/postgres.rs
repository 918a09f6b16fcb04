//! PostgreSQL dialect and backend
//!
//! Provides the `postgres` dialect:
//! - source, table and field types with `"ident"` quoting and `$n` binds
//! - native type mapping onto [`DriverKind`]
//! - a tokio-postgres backed connection with streaming reads,
//!   transactions and prepared statements
//! - the `copyIn` write mode, buffering rows in COPY text format and
//!   sending them with `COPY ... FROM STDIN` on the final flush

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{IsNull, ToSql, Type};
use tracing::{debug, warn};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, PreparedStatement, RowStream, Transaction,
    TxOptions,
};
use crate::dialect::Dialect;
use crate::driver::{ColumnTypeInfo, DriverValue};
use crate::element::{Column, Record};
use crate::error::{Error, Result};
use crate::field::{BaseField, DriverKind, Field, FieldType, Scanner, SemanticKind, Valuer};
use crate::param::{record_args, BaseParam, Parameter};
use crate::source::{BaseSource, Source};
use crate::table::{
    join_parts, BaseTable, ConfigSetter, ExecParamProvider, FieldAdder, RetryJudger, Table,
};

/// Registry name of the dialect
pub const DIALECT_NAME: &str = "postgres";

/// Name of the driver behind the dialect
pub const DRIVER_NAME: &str = "postgres";

/// Write mode using `COPY ... FROM STDIN`
pub const MODE_COPY_IN: &str = "copyIn";

/// Quote an identifier, doubling embedded quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Map a PostgreSQL type name onto its driver representation
pub fn driver_kind(type_name: &str) -> Option<DriverKind> {
    let kind = match type_name.to_ascii_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => DriverKind::Bool,
        "INT2" | "SMALLINT" => DriverKind::Int16,
        "INT4" | "INTEGER" | "INT" => DriverKind::Int32,
        "INT8" | "BIGINT" => DriverKind::Int64,
        "FLOAT4" | "REAL" => DriverKind::Float32,
        "FLOAT8" | "DOUBLE PRECISION" => DriverKind::Float64,
        "NUMERIC" | "DECIMAL" => DriverKind::Decimal,
        "VARCHAR" | "TEXT" | "BPCHAR" | "CHAR" | "NAME" => DriverKind::Text,
        "BYTEA" => DriverKind::Bytes,
        "DATE" => DriverKind::Date,
        "TIME" => DriverKind::Time,
        "TIMESTAMP" => DriverKind::Timestamp,
        "TIMESTAMPTZ" => DriverKind::TimestampTz,
        _ => return None,
    };
    Some(kind)
}

// ---------------------------------------------------------------------------
// Dialect, source, table, field
// ---------------------------------------------------------------------------

/// The `postgres` dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDialect;

impl Dialect for PgDialect {
    fn source(&self, config: serde_json::Value) -> Result<Arc<dyn Source>> {
        Ok(Arc::new(PgSource::new(config)?))
    }
}

/// PostgreSQL source
#[derive(Debug, Clone)]
pub struct PgSource {
    base: BaseSource,
}

impl PgSource {
    /// Parse a source config
    pub fn new(config: serde_json::Value) -> Result<Self> {
        Ok(Self {
            base: BaseSource::new(config)?,
        })
    }
}

impl Source for PgSource {
    fn config(&self) -> &serde_json::Value {
        self.base.config()
    }

    fn key(&self) -> &str {
        self.base.key()
    }

    fn driver_name(&self) -> &str {
        DRIVER_NAME
    }

    fn connection_factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(PgConnectionFactory)
    }

    fn table(&self, base: BaseTable) -> Arc<dyn Table> {
        Arc::new(PgTable::new(base))
    }
}

/// PostgreSQL table
#[derive(Debug)]
pub struct PgTable {
    base: BaseTable,
    one_by_one_on_constraint: AtomicBool,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PgTableConfig {
    one_by_one_on_constraint: Option<bool>,
}

impl PgTable {
    /// Wrap a table reference
    pub fn new(base: BaseTable) -> Self {
        Self {
            base,
            one_by_one_on_constraint: AtomicBool::new(true),
        }
    }

    /// Add a field directly, e.g. for tables with a known layout
    pub fn push_field(&self, field: PgField) -> Result<()> {
        self.base.append_field(Arc::new(field))
    }
}

impl Table for PgTable {
    fn instance(&self) -> &str {
        self.base.instance()
    }

    fn schema(&self) -> &str {
        self.base.schema()
    }

    fn name(&self) -> &str {
        self.base.name()
    }

    // the database is chosen by the connection, not the statement
    fn quoted(&self) -> String {
        join_parts("", self.base.schema(), self.base.name(), quote_identifier)
    }

    fn fields(&self) -> Vec<Arc<dyn Field>> {
        self.base.fields()
    }

    fn as_field_adder(&self) -> Option<&dyn FieldAdder> {
        Some(self)
    }

    fn as_exec_param_provider(&self) -> Option<&dyn ExecParamProvider> {
        Some(self)
    }

    fn as_config_setter(&self) -> Option<&dyn ConfigSetter> {
        Some(self)
    }

    fn as_retry_judger(&self) -> Option<&dyn RetryJudger> {
        Some(self)
    }
}

impl FieldAdder for PgTable {
    fn add_field(&self, base: BaseField) -> Result<()> {
        self.push_field(PgField::new(base))
    }

    fn clear_fields(&self) {
        self.base.clear_fields();
    }
}

impl ExecParamProvider for PgTable {
    fn exec_param(
        &self,
        table: &Arc<dyn Table>,
        mode: &str,
        tx_options: Option<TxOptions>,
    ) -> Option<Box<dyn Parameter>> {
        (mode == MODE_COPY_IN)
            .then(|| Box::new(CopyInParam::new(table.clone(), tx_options)) as Box<dyn Parameter>)
    }
}

impl ConfigSetter for PgTable {
    fn set_config(&self, config: &serde_json::Value) -> Result<()> {
        let parsed: PgTableConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::config(format!("invalid postgres table config: {e}")))?;
        if let Some(flag) = parsed.one_by_one_on_constraint {
            self.one_by_one_on_constraint.store(flag, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl RetryJudger for PgTable {
    fn should_one_by_one(&self, err: &Error) -> bool {
        self.one_by_one_on_constraint.load(Ordering::Relaxed)
            && matches!(err.root(), Error::Constraint { .. })
    }
}

/// PostgreSQL column type
#[derive(Debug, Clone)]
pub struct PgFieldType {
    type_info: ColumnTypeInfo,
    driver_kind: Option<DriverKind>,
}

impl PgFieldType {
    /// Type of a column described by the driver
    pub fn new(type_info: ColumnTypeInfo) -> Self {
        let driver_kind = driver_kind(&type_info.database_type_name);
        Self {
            type_info,
            driver_kind,
        }
    }

    /// Driver representation, `None` for unsupported types
    pub fn driver_kind(&self) -> Option<DriverKind> {
        self.driver_kind
    }
}

impl FieldType for PgFieldType {
    fn database_type_name(&self) -> &str {
        &self.type_info.database_type_name
    }

    fn kind(&self) -> SemanticKind {
        self.driver_kind
            .map_or(SemanticKind::Unsupported, DriverKind::semantic_kind)
    }

    fn nullable(&self) -> Option<bool> {
        self.type_info.nullable
    }
}

/// PostgreSQL column
#[derive(Debug, Clone)]
pub struct PgField {
    base: BaseField,
    field_type: PgFieldType,
}

impl PgField {
    /// Wrap driver metadata into a field
    pub fn new(base: BaseField) -> Self {
        let field_type = PgFieldType::new(base.type_info().clone());
        Self { base, field_type }
    }

    fn kind(&self) -> Result<DriverKind> {
        self.field_type.driver_kind.ok_or_else(|| {
            Error::type_conversion(format!(
                "column {} has unsupported type {}",
                self.base.name(),
                self.field_type.database_type_name()
            ))
        })
    }
}

impl Field for PgField {
    fn index(&self) -> usize {
        self.base.index()
    }

    fn name(&self) -> &str {
        self.base.name()
    }

    fn quoted(&self) -> String {
        quote_identifier(self.base.name())
    }

    fn bind_var(&self, i: usize) -> String {
        format!("${i}")
    }

    fn field_type(&self) -> &dyn FieldType {
        &self.field_type
    }

    fn scanner(&self) -> &dyn Scanner {
        self
    }

    fn valuer(&self) -> &dyn Valuer {
        self
    }
}

impl Scanner for PgField {
    fn scan(&self, raw: DriverValue) -> Result<Column> {
        self.kind()?.decode(self.base.name(), raw)
    }
}

impl Valuer for PgField {
    fn value(&self, column: &Column) -> Result<DriverValue> {
        self.kind()?.encode(column)
    }
}

/// `COPY <table> (<cols>) FROM STDIN`, one argument row per record
pub struct CopyInParam {
    base: BaseParam,
}

impl CopyInParam {
    /// Create a COPY parameter for `table`
    pub fn new(table: Arc<dyn Table>, tx_options: Option<TxOptions>) -> Self {
        Self {
            base: BaseParam::new(table, tx_options),
        }
    }
}

impl Parameter for CopyInParam {
    fn table(&self) -> &Arc<dyn Table> {
        self.base.table()
    }

    fn tx_options(&self) -> Option<TxOptions> {
        self.base.tx_options()
    }

    fn query(&self, _records: &[Record]) -> Result<String> {
        let columns = self
            .base
            .fields()?
            .iter()
            .map(|f| f.quoted())
            .collect::<Vec<_>>()
            .join(",");
        Ok(format!(
            "COPY {} ({}) FROM STDIN",
            self.table().quoted(),
            columns
        ))
    }

    fn args(&self, records: &[Record]) -> Result<Vec<DriverValue>> {
        let fields = self.base.fields()?;
        let mut args = Vec::with_capacity(fields.len() * records.len());
        for record in records {
            record_args(&fields, record, &mut args)?;
        }
        Ok(args)
    }

    fn per_statement(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Driver plumbing
// ---------------------------------------------------------------------------

/// Binds a driver value, checking it against the parameter's declared type
#[derive(Debug)]
struct PgArg<'a>(&'a DriverValue);

type SqlResult = std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>>;

impl ToSql for PgArg<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> SqlResult {
        self.to_sql_checked(ty, out)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn to_sql_checked(&self, ty: &Type, out: &mut BytesMut) -> SqlResult {
        match self.0 {
            DriverValue::Null => Ok(IsNull::Yes),
            DriverValue::Bool(v) => v.to_sql_checked(ty, out),
            DriverValue::Int16(v) => v.to_sql_checked(ty, out),
            DriverValue::Int32(v) => v.to_sql_checked(ty, out),
            DriverValue::Int64(v) => v.to_sql_checked(ty, out),
            DriverValue::Float32(v) => v.to_sql_checked(ty, out),
            DriverValue::Float64(v) => v.to_sql_checked(ty, out),
            DriverValue::Decimal(v) => v.to_sql_checked(ty, out),
            DriverValue::Text(v) => v.to_sql_checked(ty, out),
            DriverValue::Bytes(v) => v.to_sql_checked(ty, out),
            DriverValue::Date(v) => v.to_sql_checked(ty, out),
            DriverValue::Time(v) => v.to_sql_checked(ty, out),
            DriverValue::Timestamp(v) => v.to_sql_checked(ty, out),
            DriverValue::TimestampTz(v) => v.to_sql_checked(ty, out),
        }
    }
}

fn bind_args(args: &[DriverValue]) -> Vec<PgArg<'_>> {
    args.iter().map(PgArg).collect()
}

fn arg_refs<'a>(args: &'a [PgArg<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    args.iter().map(|a| a as &(dyn ToSql + Sync)).collect()
}

/// Classify a driver error
fn pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if let Some(db) = e.as_db_error() {
        let code = db.code().code();
        if code.starts_with("23") {
            return Error::constraint(format!("{} ({})", db.message(), code));
        }
        if code == "40P01" {
            return Error::Deadlock;
        }
    }
    if e.is_closed() {
        return Error::connection_with_source("connection closed", e);
    }
    Error::Query {
        message: e.to_string(),
        sql: Some(sql.to_owned()),
        source: Some(Box::new(e)),
    }
}

fn get<'a, T>(row: &'a tokio_postgres::Row, i: usize) -> Result<Option<T>>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(i)
        .map_err(|e| Error::type_conversion(format!("column {i}: {e}")))
}

/// Read column `i` of `row` as the driver value of `kind`
fn read_value(row: &tokio_postgres::Row, i: usize, kind: DriverKind) -> Result<DriverValue> {
    let value = match kind {
        DriverKind::Bool => get::<bool>(row, i)?.map(DriverValue::Bool),
        DriverKind::Int16 => get::<i16>(row, i)?.map(DriverValue::Int16),
        DriverKind::Int32 => get::<i32>(row, i)?.map(DriverValue::Int32),
        DriverKind::Int64 => get::<i64>(row, i)?.map(DriverValue::Int64),
        DriverKind::Float32 => get::<f32>(row, i)?.map(DriverValue::Float32),
        DriverKind::Float64 => get::<f64>(row, i)?.map(DriverValue::Float64),
        DriverKind::Decimal => get::<Decimal>(row, i)?.map(DriverValue::Decimal),
        DriverKind::Text => get::<String>(row, i)?.map(DriverValue::Text),
        DriverKind::Bytes => get::<Vec<u8>>(row, i)?.map(DriverValue::Bytes),
        DriverKind::Date => get::<NaiveDate>(row, i)?.map(DriverValue::Date),
        DriverKind::Time => get::<NaiveTime>(row, i)?.map(DriverValue::Time),
        DriverKind::Timestamp => get::<NaiveDateTime>(row, i)?.map(DriverValue::Timestamp),
        DriverKind::TimestampTz => get::<DateTime<Utc>>(row, i)?.map(DriverValue::TimestampTz),
    };
    Ok(value.unwrap_or(DriverValue::Null))
}

/// Streaming cursor over a tokio-postgres result
struct PgRowStream {
    columns: Vec<ColumnTypeInfo>,
    kinds: Vec<Option<DriverKind>>,
    rows: Pin<Box<tokio_postgres::RowStream>>,
    sql: String,
}

impl PgRowStream {
    fn decode(&self, row: &tokio_postgres::Row) -> Result<Vec<DriverValue>> {
        self.kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| match kind {
                Some(kind) => read_value(row, i, *kind),
                None => Err(Error::type_conversion(format!(
                    "column {} has unsupported type {}",
                    self.columns[i].name, self.columns[i].database_type_name
                ))),
            })
            .collect()
    }
}

impl RowStream for PgRowStream {
    fn columns(&self) -> &[ColumnTypeInfo] {
        &self.columns
    }

    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Vec<DriverValue>>>> + Send + '_>> {
        Box::pin(async move {
            match self.rows.next().await {
                None => Ok(None),
                Some(Err(e)) => Err(pg_error(e, &self.sql)),
                Some(Ok(row)) => self.decode(&row).map(Some),
            }
        })
    }
}

/// Operations shared by connections and transactions: both run on one client
#[derive(Clone)]
struct PgSession {
    client: Arc<tokio_postgres::Client>,
}

impl PgSession {
    async fn query(&self, sql: &str, args: &[DriverValue]) -> Result<Box<dyn RowStream>> {
        let stmt = self.client.prepare(sql).await.map_err(|e| pg_error(e, sql))?;
        let columns: Vec<ColumnTypeInfo> = stmt
            .columns()
            .iter()
            .map(|c| ColumnTypeInfo::new(c.name(), c.type_().name()))
            .collect();
        let kinds = columns
            .iter()
            .map(|c| driver_kind(&c.database_type_name))
            .collect();

        let bound = bind_args(args);
        let rows = self
            .client
            .query_raw(&stmt, arg_refs(&bound))
            .await
            .map_err(|e| pg_error(e, sql))?;

        Ok(Box::new(PgRowStream {
            columns,
            kinds,
            rows: Box::pin(rows),
            sql: sql.to_owned(),
        }))
    }

    async fn execute(&self, sql: &str, args: &[DriverValue]) -> Result<u64> {
        let bound = bind_args(args);
        self.client
            .execute(sql, &arg_refs(&bound))
            .await
            .map_err(|e| pg_error(e, sql))
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        if is_copy_from_stdin(sql) {
            return Ok(Box::new(PgCopyStatement {
                client: self.client.clone(),
                sql: sql.to_owned(),
                buffer: parking_lot::Mutex::new(String::new()),
            }));
        }
        let statement = self.client.prepare(sql).await.map_err(|e| pg_error(e, sql))?;
        Ok(Box::new(PgStatement {
            client: self.client.clone(),
            statement,
            sql: sql.to_owned(),
        }))
    }

    async fn simple(&self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| Error::Transaction {
                message: format!("{sql}: {e}"),
                source: Some(Box::new(e)),
            })
    }
}

fn is_copy_from_stdin(sql: &str) -> bool {
    let upper = sql.trim_start().to_ascii_uppercase();
    upper.starts_with("COPY ") && upper.trim_end().ends_with("FROM STDIN")
}

/// `BEGIN` statement for the given options
pub fn begin_sql(opts: &TxOptions) -> String {
    let mut sql = String::from("BEGIN");
    if let Some(level) = opts.isolation {
        sql.push_str(" ISOLATION LEVEL ");
        sql.push_str(level.to_sql());
    }
    if opts.read_only {
        sql.push_str(" READ ONLY");
    }
    sql
}

/// PostgreSQL connection
pub struct PgConnection {
    session: PgSession,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            session: PgSession {
                client: Arc::new(client),
            },
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.session.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, args: &[DriverValue]) -> Result<Box<dyn RowStream>> {
        self.check_open()?;
        self.session.query(sql, args).await
    }

    async fn execute(&self, sql: &str, args: &[DriverValue]) -> Result<u64> {
        self.check_open()?;
        self.session.execute(sql, args).await
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.check_open()?;
        self.session.prepare(sql).await
    }

    async fn begin(&self, opts: &TxOptions) -> Result<Box<dyn Transaction>> {
        self.check_open()?;
        self.session.simple(&begin_sql(opts)).await?;
        Ok(Box::new(PgTransaction {
            session: self.session.clone(),
            finished: false,
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.check_open().is_err() {
            return false;
        }
        self.session.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL transaction; rolled back in the background if dropped
/// before commit or rollback
pub struct PgTransaction {
    session: PgSession,
    finished: bool,
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.finished || self.session.client.is_closed() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let client = self.session.client.clone();
            handle.spawn(async move {
                if let Err(e) = client.batch_execute("ROLLBACK").await {
                    warn!(error = %e, "rollback of abandoned transaction failed");
                }
            });
        }
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query(&self, sql: &str, args: &[DriverValue]) -> Result<Box<dyn RowStream>> {
        self.session.query(sql, args).await
    }

    async fn execute(&self, sql: &str, args: &[DriverValue]) -> Result<u64> {
        self.session.execute(sql, args).await
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.session.prepare(sql).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.finished = true;
        this.session.simple("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.finished = true;
        this.session.simple("ROLLBACK").await
    }
}

/// PostgreSQL prepared statement
pub struct PgStatement {
    client: Arc<tokio_postgres::Client>,
    statement: tokio_postgres::Statement,
    sql: String,
}

#[async_trait]
impl PreparedStatement for PgStatement {
    async fn execute(&self, args: &[DriverValue]) -> Result<u64> {
        // nothing is buffered, so the closing no-argument call is a no-op
        if args.is_empty() && !self.statement.params().is_empty() {
            return Ok(0);
        }
        let bound = bind_args(args);
        self.client
            .execute(&self.statement, &arg_refs(&bound))
            .await
            .map_err(|e| pg_error(e, &self.sql))
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

/// `COPY ... FROM STDIN` statement.
///
/// Each `execute` with arguments appends one row; the no-argument
/// `execute` sends the buffered rows and reports how many were copied.
pub struct PgCopyStatement {
    client: Arc<tokio_postgres::Client>,
    sql: String,
    buffer: parking_lot::Mutex<String>,
}

#[async_trait]
impl PreparedStatement for PgCopyStatement {
    async fn execute(&self, args: &[DriverValue]) -> Result<u64> {
        if !args.is_empty() {
            let mut buffer = self.buffer.lock();
            encode_copy_row(args, &mut buffer);
            return Ok(0);
        }

        let data = std::mem::take(&mut *self.buffer.lock());
        if data.is_empty() {
            return Ok(0);
        }
        let sink = self
            .client
            .copy_in::<_, Bytes>(self.sql.as_str())
            .await
            .map_err(|e| pg_error(e, &self.sql))?;
        futures::pin_mut!(sink);
        sink.send(Bytes::from(data))
            .await
            .map_err(|e| pg_error(e, &self.sql))?;
        let copied = sink
            .as_mut()
            .finish()
            .await
            .map_err(|e| pg_error(e, &self.sql))?;
        debug!(rows = copied, "copy finished");
        Ok(copied)
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

/// Append one row in COPY text format: tab separated, `\N` for NULL
pub fn encode_copy_row(args: &[DriverValue], out: &mut String) {
    for (i, value) in args.iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        // writing into a String cannot fail
        let _ = match value {
            DriverValue::Null => write!(out, "\\N"),
            DriverValue::Bool(v) => write!(out, "{}", if *v { 't' } else { 'f' }),
            DriverValue::Int16(v) => write!(out, "{v}"),
            DriverValue::Int32(v) => write!(out, "{v}"),
            DriverValue::Int64(v) => write!(out, "{v}"),
            DriverValue::Float32(v) => write!(out, "{}", copy_float(f64::from(*v), v.to_string())),
            DriverValue::Float64(v) => write!(out, "{}", copy_float(*v, v.to_string())),
            DriverValue::Decimal(v) => write!(out, "{v}"),
            DriverValue::Text(v) => {
                escape_copy_text(v, out);
                Ok(())
            }
            DriverValue::Bytes(v) => {
                out.push_str("\\\\x");
                for b in v {
                    let _ = write!(out, "{b:02x}");
                }
                Ok(())
            }
            DriverValue::Date(v) => write!(out, "{}", v.format("%Y-%m-%d")),
            DriverValue::Time(v) => write!(out, "{}", v.format("%H:%M:%S%.f")),
            DriverValue::Timestamp(v) => write!(out, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            DriverValue::TimestampTz(v) => write!(out, "{}", v.format("%Y-%m-%d %H:%M:%S%.f+00")),
        };
    }
    out.push('\n');
}

fn copy_float(v: f64, text: String) -> String {
    if v.is_nan() {
        "NaN".to_owned()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_owned()
    } else {
        text
    }
}

fn escape_copy_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::connection_with_source("invalid postgres connection string", e))?;
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        pg_config.connect_timeout(timeout);
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let (client, connection) =
            tokio::time::timeout(timeout, pg_config.connect(tokio_postgres::NoTls))
                .await
                .map_err(|_| Error::timeout(format!("connect timed out after {timeout:?}")))?
                .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection error");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }

    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }
}
