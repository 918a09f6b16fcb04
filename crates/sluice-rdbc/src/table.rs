//! Table descriptors and optional table capabilities
//!
//! A [`Table`] names one physical table (instance, schema, name) and holds
//! its ordered [`Field`]s. Dialects extend tables through small capability
//! traits, queried with the `as_*` methods:
//!
//! | Capability | Purpose |
//! |------------|---------|
//! | [`FieldsFetcher`] | table discovers its own fields |
//! | [`FieldAdder`] | table turns driver metadata into dialect fields |
//! | [`ExecParamProvider`] | table supplies the write parameter for a mode |
//! | [`ConfigSetter`] | table accepts per-job JSON settings |
//! | [`RetryJudger`] | table classifies write failures for the job layer |

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use crate::connection::{Connection, TxOptions};
use crate::error::{Error, Result};
use crate::field::{BaseField, Field};
use crate::param::Parameter;

/// A table as seen by a dialect
pub trait Table: Send + Sync + fmt::Debug {
    /// Database or catalog part of the reference (may be empty)
    fn instance(&self) -> &str;

    /// Schema part of the reference (may be empty)
    fn schema(&self) -> &str;

    /// Table name
    fn name(&self) -> &str;

    /// Fully qualified reference for SQL text
    fn quoted(&self) -> String {
        join_parts(self.instance(), self.schema(), self.name(), str::to_owned)
    }

    /// Ordered fields; empty until discovered
    fn fields(&self) -> Vec<Arc<dyn Field>>;

    /// Self-populating field discovery
    fn as_fields_fetcher(&self) -> Option<&dyn FieldsFetcher> {
        None
    }

    /// Field construction from driver metadata
    fn as_field_adder(&self) -> Option<&dyn FieldAdder> {
        None
    }

    /// Write parameter override
    fn as_exec_param_provider(&self) -> Option<&dyn ExecParamProvider> {
        None
    }

    /// Per-job configuration
    fn as_config_setter(&self) -> Option<&dyn ConfigSetter> {
        None
    }

    /// Retry classification
    fn as_retry_judger(&self) -> Option<&dyn RetryJudger> {
        None
    }
}

/// Table that fills in its own fields, bypassing the zero-row query
#[async_trait]
pub trait FieldsFetcher: Send + Sync {
    /// Discover and store the table's fields using `conn`
    async fn fetch_fields(&self, conn: &dyn Connection) -> Result<()>;
}

/// Table that wraps discovered columns into dialect fields
pub trait FieldAdder: Send + Sync {
    /// Append a field built from driver metadata
    fn add_field(&self, base: BaseField) -> Result<()>;

    /// Forget previously added fields before a new discovery
    fn clear_fields(&self);
}

/// Table that supplies its own write parameter for some modes
pub trait ExecParamProvider: Send + Sync {
    /// Parameter for `mode`, or `None` when the mode is not overridden.
    ///
    /// `table` is the shared handle of the table being asked.
    fn exec_param(
        &self,
        table: &Arc<dyn Table>,
        mode: &str,
        tx_options: Option<TxOptions>,
    ) -> Option<Box<dyn Parameter>>;
}

/// Table that accepts per-job settings
pub trait ConfigSetter: Send + Sync {
    /// Apply settings from a JSON object
    fn set_config(&self, config: &serde_json::Value) -> Result<()>;
}

/// Table that classifies write errors for the caller's retry loop
pub trait RetryJudger: Send + Sync {
    /// Whether the failed operation may be retried as is
    fn should_retry(&self, err: &Error) -> bool {
        err.is_retriable()
    }

    /// Whether a failed batch should be replayed one record at a time
    fn should_one_by_one(&self, err: &Error) -> bool;
}

/// Join non-empty reference parts with `.`, quoting each one
pub fn join_parts(
    instance: &str,
    schema: &str,
    name: &str,
    quote: impl Fn(&str) -> String,
) -> String {
    [instance, schema, name]
        .into_iter()
        .filter(|part| !part.is_empty())
        .map(quote)
        .collect::<Vec<_>>()
        .join(".")
}

/// Dialect-neutral table state.
///
/// Fields sit behind a lock so discovery can fill a table that is already
/// shared as `Arc<dyn Table>`.
pub struct BaseTable {
    instance: String,
    schema: String,
    name: String,
    fields: RwLock<Vec<Arc<dyn Field>>>,
}

impl BaseTable {
    /// Create a table reference with no fields
    pub fn new(
        instance: impl Into<String>,
        schema: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            instance: instance.into(),
            schema: schema.into(),
            name: name.into(),
            fields: RwLock::new(Vec::new()),
        }
    }

    /// Database or catalog part
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Schema part
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the ordered fields
    pub fn fields(&self) -> Vec<Arc<dyn Field>> {
        self.fields.read().clone()
    }

    /// Append a field; its index must be the next position
    pub fn append_field(&self, field: Arc<dyn Field>) -> Result<()> {
        let mut fields = self.fields.write();
        if field.index() != fields.len() {
            return Err(Error::schema(format!(
                "table {}: field {} has index {}, expected {}",
                self.name,
                field.name(),
                field.index(),
                fields.len()
            )));
        }
        if fields
            .iter()
            .any(|f| f.name().eq_ignore_ascii_case(field.name()))
        {
            return Err(Error::schema(format!(
                "table {}: duplicate field {}",
                self.name,
                field.name()
            )));
        }
        fields.push(field);
        Ok(())
    }

    /// Drop all fields, e.g. before re-discovery
    pub fn clear_fields(&self) {
        self.fields.write().clear();
    }
}

impl fmt::Debug for BaseTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseTable")
            .field("instance", &self.instance)
            .field("schema", &self.schema)
            .field("name", &self.name)
            .field("fields", &self.fields.read().len())
            .finish()
    }
}

impl Table for BaseTable {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn schema(&self) -> &str {
        &self.schema
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> Vec<Arc<dyn Field>> {
        BaseTable::fields(self)
    }
}

/// Look up a field by name, case-insensitively
pub fn find_field(table: &dyn Table, name: &str) -> Option<Arc<dyn Field>> {
    table
        .fields()
        .into_iter()
        .find(|f| f.name().eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ColumnTypeInfo, DriverValue};
    use crate::element::Column;
    use crate::field::{DriverKind, FieldType, Scanner, SemanticKind, Valuer};

    #[derive(Debug)]
    struct PlainField {
        base: BaseField,
    }

    impl FieldType for PlainField {
        fn database_type_name(&self) -> &str {
            &self.base.type_info().database_type_name
        }

        fn kind(&self) -> SemanticKind {
            SemanticKind::Int64
        }
    }

    impl Scanner for PlainField {
        fn scan(&self, raw: DriverValue) -> Result<Column> {
            DriverKind::Int64.decode(self.base.name(), raw)
        }
    }

    impl Valuer for PlainField {
        fn value(&self, column: &Column) -> Result<DriverValue> {
            DriverKind::Int64.encode(column)
        }
    }

    impl Field for PlainField {
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

    fn field(index: usize, name: &str) -> Arc<dyn Field> {
        Arc::new(PlainField {
            base: BaseField::new(index, name, ColumnTypeInfo::new(name, "INT8")),
        })
    }

    #[test]
    fn test_quoted_skips_empty_parts() {
        assert_eq!(BaseTable::new("db", "schema", "t").quoted(), "db.schema.t");
        assert_eq!(BaseTable::new("", "public", "t").quoted(), "public.t");
        assert_eq!(BaseTable::new("", "", "t").quoted(), "t");
        assert_eq!(
            join_parts("", "s", "t", |p| format!("\"{p}\"")),
            "\"s\".\"t\""
        );
    }

    #[test]
    fn test_append_field_keeps_order() {
        let table = BaseTable::new("", "", "t");
        table.append_field(field(0, "id")).unwrap();
        table.append_field(field(1, "name")).unwrap();

        let names: Vec<_> = table.fields().iter().map(|f| f.name().to_owned()).collect();
        assert_eq!(names, ["id", "name"]);
        assert!(find_field(&table, "NAME").is_some());
    }

    #[test]
    fn test_append_field_rejects_bad_index_and_duplicates() {
        let table = BaseTable::new("", "", "t");
        assert!(table.append_field(field(1, "id")).is_err());
        table.append_field(field(0, "id")).unwrap();
        assert!(table.append_field(field(1, "ID")).is_err());

        table.clear_fields();
        assert!(table.fields().is_empty());
    }

    #[test]
    fn test_no_capabilities_by_default() {
        let table = BaseTable::new("", "", "t");
        assert!(table.as_fields_fetcher().is_none());
        assert!(table.as_field_adder().is_none());
        assert!(table.as_exec_param_provider().is_none());
        assert!(table.as_config_setter().is_none());
        assert!(table.as_retry_judger().is_none());
    }
}
