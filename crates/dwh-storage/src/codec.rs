use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::temporal_conversions::date32_to_datetime;
use arrow_array::types::{
    Date32Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, UInt16Type,
    UInt32Type, UInt64Type, UInt8Type,
};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, RecordBatch,
    RecordBatchOptions, StringArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use dwh_core::{LoadError, Table, Value};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

pub(crate) fn encode_csv(key: &str, table: &Table) -> Result<Vec<u8>, LoadError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(table.columns())
        .map_err(|e| LoadError::codec(key, e))?;
    for row in table.rows() {
        writer
            .write_record(row.iter().map(|v| v.to_string()))
            .map_err(|e| LoadError::codec(key, e))?;
    }
    writer.into_inner().map_err(|e| LoadError::codec(key, e))
}

pub(crate) fn decode_csv(key: &str, bytes: &[u8]) -> Result<Table, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| LoadError::codec(key, e))?
        .iter()
        .map(String::from)
        .collect::<Vec<_>>();
    let mut table = Table::new(headers);
    for record in reader.records() {
        let record = record.map_err(|e| LoadError::codec(key, e))?;
        table.push_row(record.iter().map(Value::infer).collect())?;
    }
    Ok(table)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int,
    Float,
    Date,
    Text,
}

fn column_kind<'a>(values: impl Iterator<Item = &'a Value>) -> ColumnKind {
    let mut kind: Option<ColumnKind> = None;
    for value in values {
        let this = match value {
            Value::Null => continue,
            Value::Bool(_) => ColumnKind::Bool,
            Value::Int(_) => ColumnKind::Int,
            Value::Float(_) => ColumnKind::Float,
            Value::Date(_) => ColumnKind::Date,
            Value::Text(_) => ColumnKind::Text,
        };
        kind = Some(match (kind, this) {
            (None, k) => k,
            (Some(a), b) if a == b => a,
            (Some(ColumnKind::Int), ColumnKind::Float) | (Some(ColumnKind::Float), ColumnKind::Int) => {
                ColumnKind::Float
            }
            _ => ColumnKind::Text,
        });
    }
    kind.unwrap_or(ColumnKind::Text)
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    (date - NaiveDate::default()).num_days() as i32
}

fn build_array(table: &Table, idx: usize) -> (DataType, ArrayRef) {
    let cells = table.rows().iter().map(|row| &row[idx]);
    match column_kind(cells.clone()) {
        ColumnKind::Bool => (
            DataType::Boolean,
            Arc::new(BooleanArray::from(
                cells
                    .map(|v| match v {
                        Value::Bool(b) => Some(*b),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )),
        ),
        ColumnKind::Int => (
            DataType::Int64,
            Arc::new(Int64Array::from(
                cells.map(Value::as_i64).collect::<Vec<_>>(),
            )),
        ),
        ColumnKind::Float => (
            DataType::Float64,
            Arc::new(Float64Array::from(
                cells.map(Value::as_f64).collect::<Vec<_>>(),
            )),
        ),
        ColumnKind::Date => (
            DataType::Date32,
            Arc::new(Date32Array::from(
                cells
                    .map(|v| v.as_date().map(days_since_epoch))
                    .collect::<Vec<_>>(),
            )),
        ),
        ColumnKind::Text => (
            DataType::Utf8,
            Arc::new(StringArray::from(
                cells
                    .map(|v| (!v.is_null()).then(|| v.to_string()))
                    .collect::<Vec<_>>(),
            )),
        ),
    }
}

pub(crate) fn encode_parquet(key: &str, table: &Table) -> Result<Vec<u8>, LoadError> {
    let mut fields = Vec::with_capacity(table.columns().len());
    let mut arrays = Vec::with_capacity(table.columns().len());
    for (idx, name) in table.columns().iter().enumerate() {
        let (data_type, array) = build_array(table, idx);
        fields.push(ArrowField::new(name, data_type, true));
        arrays.push(array);
    }
    let schema = Arc::new(Schema::new(fields));
    let options = RecordBatchOptions::new().with_row_count(Some(table.len()));
    let batch = RecordBatch::try_new_with_options(schema.clone(), arrays, &options)
        .map_err(|e| LoadError::codec(key, e))?;

    let mut buffer = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buffer, schema, None).map_err(|e| LoadError::codec(key, e))?;
    writer.write(&batch).map_err(|e| LoadError::codec(key, e))?;
    writer.close().map_err(|e| LoadError::codec(key, e))?;
    Ok(buffer)
}

fn cell(array: &dyn Array, row: usize) -> Result<Value, String> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    let value = match array.data_type() {
        DataType::Boolean => Value::Bool(array.as_boolean().value(row)),
        DataType::Int8 => Value::Int(array.as_primitive::<Int8Type>().value(row).into()),
        DataType::Int16 => Value::Int(array.as_primitive::<Int16Type>().value(row).into()),
        DataType::Int32 => Value::Int(array.as_primitive::<Int32Type>().value(row).into()),
        DataType::Int64 => Value::Int(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => Value::Int(array.as_primitive::<UInt8Type>().value(row).into()),
        DataType::UInt16 => Value::Int(array.as_primitive::<UInt16Type>().value(row).into()),
        DataType::UInt32 => Value::Int(array.as_primitive::<UInt32Type>().value(row).into()),
        DataType::UInt64 => {
            let raw = array.as_primitive::<UInt64Type>().value(row);
            Value::Int(i64::try_from(raw).map_err(|_| format!("value {raw} overflows i64"))?)
        }
        DataType::Float32 => Value::Float(array.as_primitive::<Float32Type>().value(row).into()),
        DataType::Float64 => Value::Float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => Value::Text(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => Value::Text(array.as_string::<i64>().value(row).to_string()),
        DataType::Date32 => {
            let days = array.as_primitive::<Date32Type>().value(row);
            date32_to_datetime(days)
                .map(|dt| Value::Date(dt.date()))
                .ok_or_else(|| format!("date value {days} out of range"))?
        }
        other => return Err(format!("unsupported column type {other}")),
    };
    Ok(value)
}

pub(crate) fn decode_parquet(key: &str, bytes: &[u8]) -> Result<Table, LoadError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::copy_from_slice(bytes))
        .map_err(|e| LoadError::codec(key, e))?;
    let columns = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect::<Vec<_>>();
    let reader = builder.build().map_err(|e| LoadError::codec(key, e))?;

    let mut table = Table::new(columns);
    for batch in reader {
        let batch = batch.map_err(|e| LoadError::codec(key, e))?;
        for row in 0..batch.num_rows() {
            let values = batch
                .columns()
                .iter()
                .map(|array| cell(array.as_ref(), row))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|detail| LoadError::codec(key, detail))?;
            table.push_row(values)?;
        }
    }
    Ok(table)
}
