//! Read/write execution engine
//!
//! [`Db`] owns the connection pool of one [`Source`] and runs parameters
//! against it:
//!
//! - reads stream rows through each field's scanner into [`Record`]s handed
//!   to a caller callback, optionally inside a transaction
//! - writes pick a parameter for the write mode and run it as one multi-row
//!   statement, or as a prepared statement executed once per record and
//!   flushed with a final no-argument execute
//!
//! Transactions roll back on any failure. The engine never retries; every
//! error is wrapped with the operation name and SQL text and returned.

use std::slice;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{PreparedStatement, RowStream, Transaction, TxOptions};
use crate::element::{Column, Record};
use crate::error::{Error, ErrorContext, Result};
use crate::field::{BaseField, Field};
use crate::param::{exec_param_for, MaxParam, MinParam, Parameter, SplitQueryParam, TableQueryParam};
use crate::pool::{
    ConnectionPool, PoolConfig, PoolPolicy, PoolStats, PooledConnection, SimpleConnectionPool,
};
use crate::source::Source;
use crate::split::{SplitConfig, SplitRange};
use crate::table::{find_field, BaseTable, Table};

/// Pooled database handle of one source
pub struct Db {
    source: Arc<dyn Source>,
    pool: Arc<dyn ConnectionPool>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("source", &self.source.connect_name())
            .field("driver", &self.source.driver_name())
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl Db {
    /// Open a pool for `source`, sized by its `"pool"` policy, and ping it
    pub async fn open(source: Arc<dyn Source>) -> Result<Self> {
        let policy = PoolPolicy::from_json(source.config()).op("Open", None)?;
        let config = PoolConfig::from_policy(source.connection_config(), &policy);
        let max_open = config.max_open;
        let pool = SimpleConnectionPool::new(config, source.connection_factory());
        let db = Self::with_pool(source, pool);

        if let Err(e) = db.ping().await {
            if let Err(close_err) = db.pool.close().await {
                warn!(error = %close_err, "failed to close pool after ping failure");
            }
            return Err(e).op("Open", None);
        }

        info!(
            source = %db.source.connect_name(),
            driver = db.source.driver_name(),
            max_open,
            "database opened"
        );
        Ok(db)
    }

    /// Wrap an existing pool
    pub fn with_pool(source: Arc<dyn Source>, pool: Arc<dyn ConnectionPool>) -> Self {
        Self { source, pool }
    }

    /// The source this database was opened from
    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    /// Build the dialect table for `base`
    pub fn table(&self, base: BaseTable) -> Arc<dyn Table> {
        self.source.table(base)
    }

    /// Check that a connection can be borrowed and is alive
    pub async fn ping(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        if !conn.is_valid().await {
            return Err(Error::connection(format!(
                "ping {} failed",
                self.source.connect_name()
            )));
        }
        Ok(())
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close the pool
    pub async fn close(&self) -> Result<()> {
        self.pool.close().await.op("Close", None)?;
        info!(source = %self.source.connect_name(), "database closed");
        Ok(())
    }

    /// Discover the fields of `table` with a zero-row query
    pub async fn fetch_table(&self, table: &Arc<dyn Table>) -> Result<()> {
        self.fetch_table_with_param(&TableQueryParam::new(table.clone()))
            .await
    }

    /// Discover the fields of `param`'s table.
    ///
    /// Tables that fetch their own fields are delegated to; otherwise the
    /// query's column metadata is turned into fields through the table's
    /// field adder. Every field must have a supported type.
    pub async fn fetch_table_with_param(&self, param: &dyn Parameter) -> Result<()> {
        const OP: &str = "FetchTable";
        let table = param.table();
        let conn = self.pool.get().await.op(OP, None)?;

        if let Some(fetcher) = table.as_fields_fetcher() {
            fetcher.fetch_fields(conn.connection()).await.op(OP, None)?;
        } else {
            let adder = table.as_field_adder().ok_or_else(|| {
                Error::schema(format!("table {} cannot add fields", table.quoted()))
            });
            let adder = adder.op(OP, None)?;
            let sql = param.query(&[]).op(OP, None)?;
            let args = param.args(&[]).op(OP, Some(&sql))?;
            debug!(table = %table.quoted(), sql = %sql, "probing table");

            let stream = conn.query(&sql, &args).await.op(OP, Some(&sql))?;
            adder.clear_fields();
            for (i, column) in stream.columns().iter().enumerate() {
                adder
                    .add_field(BaseField::new(i, column.name.clone(), column.clone()))
                    .op(OP, Some(&sql))?;
            }
        }

        for field in table.fields() {
            let field_type = field.field_type();
            if !field_type.is_supported() {
                return Err(Error::schema(format!(
                    "table {} field {} has unsupported type {}",
                    table.quoted(),
                    field.name(),
                    field_type.database_type_name()
                )))
                .op(OP, None);
            }
        }
        debug!(table = %table.quoted(), fields = table.fields().len(), "table fetched");
        Ok(())
    }

    /// Run a read and pass every row to `handler` as a record.
    ///
    /// Returns the number of rows handled. A handler error stops the scan.
    pub async fn fetch_record<F>(
        &self,
        param: &dyn Parameter,
        mut handler: F,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        F: FnMut(Record) -> Result<()> + Send,
    {
        const OP: &str = "FetchRecord";
        let sql = param.query(&[]).op(OP, None)?;
        let args = param.args(&[]).op(OP, Some(&sql))?;
        debug!(table = %param.table().quoted(), sql = %sql, "fetching records");

        let conn = self.pool.get().await.op(OP, Some(&sql))?;
        let stream = conn.query(&sql, &args).await.op(OP, Some(&sql))?;
        scan_rows(param.table().as_ref(), stream, &mut handler, cancel)
            .await
            .op(OP, Some(&sql))
    }

    /// [`Db::fetch_record`] inside a transaction opened with the parameter's
    /// options; committed on success, rolled back on any error
    pub async fn fetch_record_with_tx<F>(
        &self,
        param: &dyn Parameter,
        mut handler: F,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        F: FnMut(Record) -> Result<()> + Send,
    {
        const OP: &str = "FetchRecordWithTx";
        let sql = param.query(&[]).op(OP, None)?;
        let args = param.args(&[]).op(OP, Some(&sql))?;
        debug!(table = %param.table().quoted(), sql = %sql, "fetching records in transaction");

        let mut conn = self.pool.get().await.op(OP, Some(&sql))?;
        let tx = begin_tx(&mut conn, &param.tx_options().unwrap_or_default())
            .await
            .op(OP, None)?;

        let scanned = async {
            let stream = tx.query(&sql, &args).await?;
            scan_rows(param.table().as_ref(), stream, &mut handler, cancel).await
        }
        .await;

        finish_tx(&mut conn, tx, scanned).await.op(OP, Some(&sql))
    }

    /// Write `records` as one multi-row statement
    pub async fn batch_exec(&self, table: &Arc<dyn Table>, mode: &str, records: &[Record]) -> Result<u64> {
        const OP: &str = "BatchExec";
        if records.is_empty() {
            return Ok(0);
        }
        let param = exec_param_for(table, mode, None).op(OP, None)?;
        check_multi_row(param.as_ref(), mode).op(OP, None)?;
        let sql = param.query(records).op(OP, None)?;
        let args = param.args(records).op(OP, Some(&sql))?;

        let conn = self.pool.get().await.op(OP, Some(&sql))?;
        let affected = conn.execute(&sql, &args).await.op(OP, Some(&sql))?;
        debug!(table = %table.quoted(), records = records.len(), affected, "batch executed");
        Ok(affected)
    }

    /// [`Db::batch_exec`] inside one transaction
    pub async fn batch_exec_with_tx(
        &self,
        table: &Arc<dyn Table>,
        mode: &str,
        tx_options: TxOptions,
        records: &[Record],
    ) -> Result<u64> {
        const OP: &str = "BatchExecWithTx";
        if records.is_empty() {
            return Ok(0);
        }
        let param = exec_param_for(table, mode, Some(tx_options)).op(OP, None)?;
        check_multi_row(param.as_ref(), mode).op(OP, None)?;
        let sql = param.query(records).op(OP, None)?;
        let args = param.args(records).op(OP, Some(&sql))?;

        let mut conn = self.pool.get().await.op(OP, Some(&sql))?;
        let tx = begin_tx(&mut conn, &param.tx_options().unwrap_or(tx_options))
            .await
            .op(OP, None)?;
        let executed = tx.execute(&sql, &args).await;
        let affected = finish_tx(&mut conn, tx, executed).await.op(OP, Some(&sql))?;
        debug!(table = %table.quoted(), records = records.len(), affected, "batch committed");
        Ok(affected)
    }

    /// Prepare once, execute once per record, then flush; no transaction
    pub async fn batch_exec_stmt(
        &self,
        table: &Arc<dyn Table>,
        mode: &str,
        records: &[Record],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        const OP: &str = "BatchExecStmt";
        if records.is_empty() {
            return Ok(0);
        }
        let param = exec_param_for(table, mode, None).op(OP, None)?;
        let sql = param.query(&records[..1]).op(OP, None)?;

        let conn = self.pool.get().await.op(OP, Some(&sql))?;
        let stmt = conn.prepare(&sql).await.op(OP, Some(&sql))?;
        let affected = exec_each(stmt.as_ref(), param.as_ref(), records, cancel)
            .await
            .op(OP, Some(&sql))?;
        debug!(table = %table.quoted(), records = records.len(), affected, "statement batch executed");
        Ok(affected)
    }

    /// Prepare once, execute once per record, then flush, all inside one
    /// transaction; any failure rolls the whole batch back
    pub async fn batch_exec_stmt_with_tx(
        &self,
        table: &Arc<dyn Table>,
        mode: &str,
        tx_options: TxOptions,
        records: &[Record],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        const OP: &str = "BatchExecStmtWithTx";
        if records.is_empty() {
            return Ok(0);
        }
        let param = exec_param_for(table, mode, Some(tx_options)).op(OP, None)?;
        let sql = param.query(&records[..1]).op(OP, None)?;

        let mut conn = self.pool.get().await.op(OP, Some(&sql))?;
        let tx = begin_tx(&mut conn, &param.tx_options().unwrap_or(tx_options))
            .await
            .op(OP, None)?;

        let executed = async {
            let stmt = tx.prepare(&sql).await?;
            exec_each(stmt.as_ref(), param.as_ref(), records, cancel).await
        }
        .await;

        let affected = finish_tx(&mut conn, tx, executed).await.op(OP, Some(&sql))?;
        debug!(table = %table.quoted(), records = records.len(), affected, "statement batch committed");
        Ok(affected)
    }

    /// Smallest and largest value of the column `key` in `table`
    pub async fn fetch_min_max(
        &self,
        table: &Arc<dyn Table>,
        key: &str,
        tx_options: Option<TxOptions>,
    ) -> Result<(Column, Column)> {
        const OP: &str = "FetchMinMax";
        let field = find_field(table.as_ref(), key)
            .ok_or_else(|| Error::schema(format!("table {} has no field {}", table.quoted(), key)))
            .op(OP, None)?;

        let min = MinParam::min(table.clone(), field.clone(), tx_options);
        let max = MaxParam::max(table.clone(), field.clone(), tx_options);
        let min = self.query_scalar(&min, field.as_ref()).await.op(OP, None)?;
        let max = self.query_scalar(&max, field.as_ref()).await.op(OP, None)?;
        Ok((min, max))
    }

    async fn query_scalar(&self, param: &dyn Parameter, field: &dyn Field) -> Result<Column> {
        let sql = param.query(&[])?;
        let args = param.args(&[])?;
        let conn = self.pool.get().await?;
        let mut stream = conn.query(&sql, &args).await.op("Query", Some(&sql))?;
        let row = stream
            .next()
            .await?
            .ok_or_else(|| Error::query_with_sql("no row returned", sql.clone()))?;
        let raw = row
            .into_iter()
            .next()
            .ok_or_else(|| Error::query_with_sql("no column returned", sql.clone()))?;
        field.scanner().scan(raw)
    }

    /// Partition the split key of `table` into at most `num` ranges.
    ///
    /// Bounds come from the config when both are given, otherwise from
    /// `min`/`max` queries.
    pub async fn split_ranges(
        &self,
        table: &Arc<dyn Table>,
        config: &SplitConfig,
        num: usize,
    ) -> Result<Vec<SplitRange>> {
        const OP: &str = "Split";
        let field = find_field(table.as_ref(), &config.key)
            .ok_or_else(|| {
                Error::partition(format!(
                    "table {} has no split key {}",
                    table.quoted(),
                    config.key
                ))
            })
            .op(OP, None)?;

        let (min, max) = match config.bound_columns(field.as_ref()).op(OP, None)? {
            Some(bounds) => bounds,
            None => self.fetch_min_max(table, &config.key, None).await?,
        };
        let ranges = config
            .split(field.as_ref(), &min, &max, num)
            .op(OP, None)?;
        debug!(table = %table.quoted(), key = %config.key, ranges = ranges.len(), "split planned");
        Ok(ranges)
    }

    /// One read parameter per split range
    pub async fn split_query_params(
        &self,
        table: &Arc<dyn Table>,
        config: &SplitConfig,
        num: usize,
        tx_options: Option<TxOptions>,
    ) -> Result<Vec<SplitQueryParam>> {
        let ranges = self.split_ranges(table, config, num).await?;
        let key = find_field(table.as_ref(), &config.key)
            .ok_or_else(|| Error::partition(format!("no split key {}", config.key)))?;
        Ok(ranges
            .into_iter()
            .map(|range| SplitQueryParam::new(table.clone(), key.clone(), range, tx_options))
            .collect())
    }
}

/// Scan every row of `stream` into a record and hand it to `handler`
async fn scan_rows<F>(
    table: &dyn Table,
    mut stream: Box<dyn RowStream>,
    handler: &mut F,
    cancel: &CancellationToken,
) -> Result<u64>
where
    F: FnMut(Record) -> Result<()> + Send,
{
    let fields = table.fields();
    if fields.len() != stream.columns().len() {
        return Err(Error::schema(format!(
            "table {} has {} fields, result has {} columns",
            table.quoted(),
            fields.len(),
            stream.columns().len()
        )));
    }

    let mut rows = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(row) = stream.next().await? else {
            break;
        };

        if row.len() != fields.len() {
            return Err(Error::schema(format!(
                "table {} has {} fields, row {} has {} values",
                table.quoted(),
                fields.len(),
                rows + 1,
                row.len()
            )));
        }
        let mut record = Record::with_capacity(fields.len());
        for (field, raw) in fields.iter().zip(row) {
            record.add(field.scanner().scan(raw)?)?;
        }
        handler(record)?;
        rows += 1;
    }
    Ok(rows)
}

/// Reject parameters that only run prepared, one record per execute
fn check_multi_row(param: &dyn Parameter, mode: &str) -> Result<()> {
    if param.per_statement() {
        return Err(Error::unsupported(format!(
            "write mode {mode} runs per statement only; use batch_exec_stmt"
        )));
    }
    Ok(())
}

/// Execute the prepared statement once per record, then flush
async fn exec_each(
    stmt: &dyn PreparedStatement,
    param: &dyn Parameter,
    records: &[Record],
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut affected = 0;
    for record in records {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let args = param.args(slice::from_ref(record))?;
        affected += stmt.execute(&args).await?;
    }
    affected += stmt.execute(&[]).await?;
    stmt.close().await?;
    Ok(affected)
}

/// Open a transaction on `conn`.
///
/// The connection stays marked broken until [`finish_tx`] ends the
/// transaction cleanly, so a dropped future or a failed rollback never hands
/// a connection with an open transaction back to the pool.
async fn begin_tx(conn: &mut PooledConnection, opts: &TxOptions) -> Result<Box<dyn Transaction>> {
    conn.mark_broken();
    conn.begin(opts).await
}

/// Commit on success, roll back on failure; the operation error wins
async fn finish_tx<T>(
    conn: &mut PooledConnection,
    tx: Box<dyn Transaction>,
    outcome: Result<T>,
) -> Result<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            conn.mark_healthy();
            Ok(value)
        }
        Err(e) => {
            match tx.rollback().await {
                Ok(()) => conn.mark_healthy(),
                Err(rollback_err) => {
                    warn!(error = %rollback_err, "rollback failed, discarding connection");
                }
            }
            Err(e)
        }
    }
}
