//! Tests for sluice-rdbc query parameters

mod common;

use common::{MockField, MockTable};
use sluice_rdbc::param::exec_param_for;
use sluice_rdbc::prelude::*;
use std::sync::Arc;

fn table(instance: &str, schema: &str, name: &str, fields: &[(&str, &str)]) -> Arc<dyn Table> {
    let base = BaseTable::new(instance, schema, name);
    for (i, (field, ty)) in fields.iter().enumerate() {
        base.append_field(Arc::new(MockField::new(i, field, ty))).unwrap();
    }
    Arc::new(MockTable::new(base))
}

fn record(values: &[i64]) -> Record {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| Column::bigint(format!("f{}", i + 1), *v))
        .collect()
}

// ==================== InsertParam ====================

#[test]
fn test_insert_query_numbers_binds_across_rows() {
    let t = table("db", "schema", "table", &[("f1", "INT8"), ("f2", "INT8"), ("f3", "INT8")]);
    let param = InsertParam::new(t, None);
    let records = [record(&[1, 2, 3]), record(&[4, 5, 6]), record(&[7, 8, 9])];

    assert_eq!(
        param.query(&records).unwrap(),
        "insert into db.schema.table(f1,f2,f3) values($1,$2,$3),($4,$5,$6),($7,$8,$9)"
    );
    let args = param.args(&records).unwrap();
    assert_eq!(args.len(), 9);
    assert_eq!(args[0], DriverValue::Int64(1));
    assert_eq!(args[8], DriverValue::Int64(9));
}

#[test]
fn test_insert_narrows_values_per_field() {
    let t = table("", "", "t", &[("f1", "INT4"), ("f2", "TEXT")]);
    let param = InsertParam::new(t, None);
    let rec: Record = [Column::bigint("f1", 5), Column::string("f2", "x")]
        .into_iter()
        .collect();
    assert_eq!(
        param.args(&[rec]).unwrap(),
        vec![DriverValue::Int32(5), DriverValue::Text("x".into())]
    );

    let overflow: Record = [Column::bigint("f1", i64::MAX), Column::string("f2", "x")]
        .into_iter()
        .collect();
    assert!(param.args(&[overflow]).is_err());
}

#[test]
fn test_insert_requires_fields_and_records() {
    let empty = table("", "", "t", &[]);
    let param = InsertParam::new(empty, None);
    assert!(matches!(param.query(&[record(&[1])]), Err(Error::Schema { .. })));

    let t = table("", "", "t", &[("f1", "INT8")]);
    assert!(InsertParam::new(t, None).query(&[]).is_err());
}

#[test]
fn test_insert_short_record_is_error() {
    let t = table("", "", "t", &[("f1", "INT8"), ("f2", "INT8")]);
    let err = InsertParam::new(t, None).args(&[record(&[1])]).unwrap_err();
    assert!(matches!(err, Error::TypeConversion { .. }));
}

// ==================== Read parameters ====================

#[test]
fn test_table_query_param_is_zero_row_query() {
    let t = table("", "public", "orders", &[]);
    let param = TableQueryParam::new(t);
    assert_eq!(param.query(&[]).unwrap(), "select * from public.orders where 1=2");
    assert!(param.args(&[]).unwrap().is_empty());
    assert!(param.tx_options().is_none());
}

#[test]
fn test_min_max_params() {
    let t = table("", "", "orders", &[("id", "INT8")]);
    let key = t.fields()[0].clone();
    let opts = Some(TxOptions::default().read_only());

    let min = BoundParam::min(t.clone(), key.clone(), opts);
    let max = BoundParam::max(t, key, None);
    assert_eq!(min.query(&[]).unwrap(), "select min(id) from orders");
    assert_eq!(max.query(&[]).unwrap(), "select max(id) from orders");
    assert_eq!(min.tx_options(), opts);
    assert_eq!(min.key().name(), "id");
}

#[test]
fn test_split_query_param_lists_fields() {
    let t = table("", "", "events", &[("id", "INT8"), ("at", "TIMESTAMP")]);
    let key = t.fields()[0].clone();
    let mut ranges = sluice_rdbc::split::split(
        SplitType::BigInt,
        "",
        None,
        key.as_ref(),
        &Column::bigint("id", 0),
        &Column::bigint("id", 100),
        2,
    )
    .unwrap();
    let last = ranges.pop().unwrap();

    let param = SplitQueryParam::new(t, key, last, None);
    assert_eq!(
        param.query(&[]).unwrap(),
        "select id,at from events where id >= $1 and id <= $2"
    );
    assert_eq!(
        param.args(&[]).unwrap(),
        vec![DriverValue::Int64(50), DriverValue::Int64(100)]
    );
}

// ==================== Mode selection ====================

#[test]
fn test_exec_param_for_modes() {
    let t = table("", "", "t", &[("f1", "INT8")]);
    let insert = exec_param_for(&t, MODE_INSERT, None).unwrap();
    assert_eq!(insert.query(&[record(&[1])]).unwrap(), "insert into t(f1) values($1)");

    let err = exec_param_for(&t, "copyIn", None).err().unwrap();
    assert!(matches!(err, Error::Unsupported { .. }));
}
