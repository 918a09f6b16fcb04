//! Query parameters: SQL text plus bind arguments for one operation
//!
//! A [`Parameter`] turns a batch of records into a statement. `query` and
//! `args` are always called with the same batch; either failing aborts the
//! operation before any SQL reaches the database.

use std::sync::Arc;

use crate::connection::TxOptions;
use crate::driver::DriverValue;
use crate::element::Record;
use crate::error::{Error, Result};
use crate::field::Field;
use crate::split::SplitRange;
use crate::table::Table;

/// Write mode handled by [`InsertParam`] on every dialect
pub const MODE_INSERT: &str = "insert";

/// SQL template and bind arguments for one logical operation
pub trait Parameter: Send + Sync {
    /// Table the statement targets
    fn table(&self) -> &Arc<dyn Table>;

    /// Transaction options for transactional execution
    fn tx_options(&self) -> Option<TxOptions>;

    /// SQL text for `records`
    fn query(&self, records: &[Record]) -> Result<String>;

    /// Bind arguments for `records`, in placeholder order
    fn args(&self, records: &[Record]) -> Result<Vec<DriverValue>>;

    /// Whether the statement only runs prepared, one record per execute
    /// (e.g. bulk copy); such parameters cannot back a multi-row statement
    fn per_statement(&self) -> bool {
        false
    }
}

/// Table and transaction options shared by every parameter
#[derive(Debug, Clone)]
pub struct BaseParam {
    table: Arc<dyn Table>,
    tx_options: Option<TxOptions>,
}

impl BaseParam {
    /// Create a base parameter
    pub fn new(table: Arc<dyn Table>, tx_options: Option<TxOptions>) -> Self {
        Self { table, tx_options }
    }

    /// Target table
    pub fn table(&self) -> &Arc<dyn Table> {
        &self.table
    }

    /// Transaction options
    pub fn tx_options(&self) -> Option<TxOptions> {
        self.tx_options
    }

    /// Fields of the table; an error when none were discovered yet
    pub fn fields(&self) -> Result<Vec<Arc<dyn Field>>> {
        let fields = self.table.fields();
        if fields.is_empty() {
            return Err(Error::schema(format!(
                "table {} has no fields",
                self.table.quoted()
            )));
        }
        Ok(fields)
    }
}

/// Encode every column of `record` through the matching field's valuer
pub fn record_args(
    fields: &[Arc<dyn Field>],
    record: &Record,
    out: &mut Vec<DriverValue>,
) -> Result<()> {
    for field in fields {
        let column = record.get(field.index()).ok_or_else(|| {
            Error::type_conversion(format!(
                "record has {} columns, field {} is at {}",
                record.len(),
                field.name(),
                field.index()
            ))
        })?;
        out.push(field.valuer().value(column)?);
    }
    Ok(())
}

/// Multi-row `insert into <table>(<cols>) values (...),(...)`
pub struct InsertParam {
    base: BaseParam,
}

impl InsertParam {
    /// Create an insert parameter for `table`
    pub fn new(table: Arc<dyn Table>, tx_options: Option<TxOptions>) -> Self {
        Self {
            base: BaseParam::new(table, tx_options),
        }
    }
}

impl Parameter for InsertParam {
    fn table(&self) -> &Arc<dyn Table> {
        self.base.table()
    }

    fn tx_options(&self) -> Option<TxOptions> {
        self.base.tx_options()
    }

    fn query(&self, records: &[Record]) -> Result<String> {
        if records.is_empty() {
            return Err(Error::query("insert needs at least one record"));
        }
        let fields = self.base.fields()?;

        let columns = fields
            .iter()
            .map(|f| f.quoted())
            .collect::<Vec<_>>()
            .join(",");

        let mut sql = format!("insert into {}({}) values", self.table().quoted(), columns);
        let mut bind = 0;
        for row in 0..records.len() {
            if row > 0 {
                sql.push(',');
            }
            sql.push('(');
            for (i, field) in fields.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                bind += 1;
                sql.push_str(&field.bind_var(bind));
            }
            sql.push(')');
        }
        Ok(sql)
    }

    fn args(&self, records: &[Record]) -> Result<Vec<DriverValue>> {
        let fields = self.base.fields()?;
        let mut args = Vec::with_capacity(fields.len() * records.len());
        for record in records {
            record_args(&fields, record, &mut args)?;
        }
        Ok(args)
    }
}

/// Zero-row query used to read driver column metadata
pub struct TableQueryParam {
    base: BaseParam,
}

impl TableQueryParam {
    /// Create a metadata query for `table`
    pub fn new(table: Arc<dyn Table>) -> Self {
        Self {
            base: BaseParam::new(table, None),
        }
    }
}

impl Parameter for TableQueryParam {
    fn table(&self) -> &Arc<dyn Table> {
        self.base.table()
    }

    fn tx_options(&self) -> Option<TxOptions> {
        None
    }

    fn query(&self, _records: &[Record]) -> Result<String> {
        Ok(format!("select * from {} where 1=2", self.table().quoted()))
    }

    fn args(&self, _records: &[Record]) -> Result<Vec<DriverValue>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    Min,
    Max,
}

/// `select min(<key>) from <table>` / `select max(<key>) from <table>`
pub struct BoundParam {
    base: BaseParam,
    key: Arc<dyn Field>,
    bound: Bound,
}

/// Query for the smallest split-key value
pub type MinParam = BoundParam;

/// Query for the largest split-key value
pub type MaxParam = BoundParam;

impl BoundParam {
    /// Minimum of `key` over `table`
    pub fn min(table: Arc<dyn Table>, key: Arc<dyn Field>, tx_options: Option<TxOptions>) -> Self {
        Self {
            base: BaseParam::new(table, tx_options),
            key,
            bound: Bound::Min,
        }
    }

    /// Maximum of `key` over `table`
    pub fn max(table: Arc<dyn Table>, key: Arc<dyn Field>, tx_options: Option<TxOptions>) -> Self {
        Self {
            base: BaseParam::new(table, tx_options),
            key,
            bound: Bound::Max,
        }
    }

    /// Split-key field
    pub fn key(&self) -> &Arc<dyn Field> {
        &self.key
    }
}

impl Parameter for BoundParam {
    fn table(&self) -> &Arc<dyn Table> {
        self.base.table()
    }

    fn tx_options(&self) -> Option<TxOptions> {
        self.base.tx_options()
    }

    fn query(&self, _records: &[Record]) -> Result<String> {
        let func = match self.bound {
            Bound::Min => "min",
            Bound::Max => "max",
        };
        Ok(format!(
            "select {}({}) from {}",
            func,
            self.key.quoted(),
            self.table().quoted()
        ))
    }

    fn args(&self, _records: &[Record]) -> Result<Vec<DriverValue>> {
        Ok(Vec::new())
    }
}

/// Read one partition: `select <cols> from <table> where <range>`
pub struct SplitQueryParam {
    base: BaseParam,
    key: Arc<dyn Field>,
    range: SplitRange,
}

impl SplitQueryParam {
    /// Create a partition read over `range` of `key`
    pub fn new(
        table: Arc<dyn Table>,
        key: Arc<dyn Field>,
        range: SplitRange,
        tx_options: Option<TxOptions>,
    ) -> Self {
        Self {
            base: BaseParam::new(table, tx_options),
            key,
            range,
        }
    }

    /// The partition being read
    pub fn range(&self) -> &SplitRange {
        &self.range
    }
}

impl Parameter for SplitQueryParam {
    fn table(&self) -> &Arc<dyn Table> {
        self.base.table()
    }

    fn tx_options(&self) -> Option<TxOptions> {
        self.base.tx_options()
    }

    fn query(&self, _records: &[Record]) -> Result<String> {
        let fields = self.table().fields();
        let columns = if fields.is_empty() {
            "*".to_owned()
        } else {
            fields
                .iter()
                .map(|f| f.select())
                .collect::<Vec<_>>()
                .join(",")
        };
        Ok(format!(
            "select {} from {} where {}",
            columns,
            self.table().quoted(),
            self.range.where_clause()
        ))
    }

    fn args(&self, _records: &[Record]) -> Result<Vec<DriverValue>> {
        let name = self.key.name();
        let valuer = self.key.valuer();
        Ok(vec![
            valuer.value(&self.range.left_column(name)?)?,
            valuer.value(&self.range.right_column(name)?)?,
        ])
    }
}

/// Pick the write parameter for `mode`.
///
/// A table override wins; without one only [`MODE_INSERT`] is available.
pub fn exec_param_for(
    table: &Arc<dyn Table>,
    mode: &str,
    tx_options: Option<TxOptions>,
) -> Result<Box<dyn Parameter>> {
    if let Some(param) = table
        .as_exec_param_provider()
        .and_then(|p| p.exec_param(table, mode, tx_options))
    {
        return Ok(param);
    }
    if mode == MODE_INSERT {
        return Ok(Box::new(InsertParam::new(table.clone(), tx_options)));
    }
    Err(Error::unsupported(format!(
        "table {} has no write mode {}",
        table.quoted(),
        mode
    )))
}
