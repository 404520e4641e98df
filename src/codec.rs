//! Arrow <-> Parquet codec: one chunk in, one Parquet blob out (and back),
//! with column projection and simple row-predicate pushdown on decode.

use std::sync::Arc;

use arrow::array::{
    Array, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
};
use arrow::compute::filter_record_batch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::arrow::ProjectionMask;
use parquet::basic::{Compression, Encoding};
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use rayon::prelude::*;

use crate::error::{Error, Result};

/// A simple row predicate: `column op literal`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub literal: Literal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .set_statistics_enabled(EnabledStatistics::Chunk)
        .set_encoding(Encoding::PLAIN)
        .build()
}

/// Encode a single batch to a Parquet chunk in memory, zstd-compressed
/// with per-column statistics.
pub fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(writer_properties()))?;
        writer.write(batch)?;
        writer.close()?;
    }
    Ok(buf)
}

/// Encode many batches independently and in parallel — chunks never share
/// encoder state.
pub fn encode_batches_parallel(batches: &[RecordBatch]) -> Result<Vec<Vec<u8>>> {
    batches.par_iter().map(encode_batch).collect()
}

fn reader_builder(bytes: Vec<u8>) -> Result<ParquetRecordBatchReaderBuilder<Bytes>> {
    Ok(ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))?)
}

fn read_all_batches(
    builder: ParquetRecordBatchReaderBuilder<Bytes>,
) -> Result<(arrow::datatypes::SchemaRef, Vec<RecordBatch>)> {
    let schema = builder.schema().clone();
    let reader = builder.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok((schema, batches))
}

fn concat_or_empty(
    schema: arrow::datatypes::SchemaRef,
    batches: Vec<RecordBatch>,
) -> Result<RecordBatch> {
    if batches.is_empty() {
        return Ok(RecordBatch::new_empty(schema));
    }
    if batches.len() == 1 {
        return Ok(batches.into_iter().next().unwrap());
    }
    Ok(arrow::compute::concat_batches(&schema, &batches)?)
}

/// Full decode of a chunk.
pub fn decode(bytes: Vec<u8>) -> Result<RecordBatch> {
    let builder = reader_builder(bytes)?;
    let (schema, batches) = read_all_batches(builder)?;
    concat_or_empty(schema, batches)
}

/// Projection pushdown: only the named columns are read from Parquet.
pub fn decode_columns_by_name(bytes: Vec<u8>, names: &[String]) -> Result<RecordBatch> {
    let builder = reader_builder(bytes)?;
    let parquet_schema = builder.parquet_schema();

    let mut indices = Vec::with_capacity(names.len());
    for name in names {
        let idx = parquet_schema
            .columns()
            .iter()
            .position(|col| col.name() == name)
            .ok_or_else(|| Error::InvalidColumn(name.clone()))?;
        indices.push(idx);
    }
    let mask = ProjectionMask::leaves(parquet_schema, indices);
    let builder = builder.with_projection(mask);
    let (schema, batches) = read_all_batches(builder)?;
    concat_or_empty(schema, batches)
}

/// Predicate pushdown: decode the full row, evaluate the filter
/// conjunction, and only then project to the requested columns — a filter
/// may reference a column the caller isn't selecting, so filtering must
/// happen before projection, not after. Fails with `EmptyResult` when
/// nothing matches — callers are expected to convert that into an empty
/// table with the projected schema.
pub fn decode_with_filter(
    bytes: Vec<u8>,
    columns: Option<&[String]>,
    filters: &[Filter],
) -> Result<RecordBatch> {
    let batch = decode(bytes)?;
    let filtered = apply_filters(&batch, filters)?;
    let out = match columns {
        Some(names) => {
            let schema = filtered.schema();
            let indices: Vec<usize> = names
                .iter()
                .map(|n| schema.index_of(n).map_err(|_| Error::InvalidColumn(n.clone())))
                .collect::<Result<_>>()?;
            filtered.project(&indices)?
        }
        None => filtered,
    };
    if out.num_rows() == 0 {
        return Err(Error::EmptyResult);
    }
    Ok(out)
}

/// Apply a conjunction of filters to a batch, returning the matching rows.
/// An empty result is a valid (zero-row) batch here; `EmptyResult` is only
/// raised by `decode_with_filter`, which knows the caller's context.
pub fn apply_filters(batch: &RecordBatch, filters: &[Filter]) -> Result<RecordBatch> {
    if filters.is_empty() {
        return Ok(batch.clone());
    }
    let mut mask: Option<BooleanArray> = None;
    for filter in filters {
        let column_mask = evaluate_filter(batch, filter)?;
        mask = Some(match mask {
            None => column_mask,
            Some(existing) => and_bool(&existing, &column_mask),
        });
    }
    let mask = mask.expect("filters is non-empty");
    Ok(filter_record_batch(batch, &mask)?)
}

fn and_bool(a: &BooleanArray, b: &BooleanArray) -> BooleanArray {
    BooleanArray::from(
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| Some(x.unwrap_or(false) && y.unwrap_or(false)))
            .collect::<Vec<_>>(),
    )
}

fn evaluate_filter(batch: &RecordBatch, filter: &Filter) -> Result<BooleanArray> {
    let column = batch
        .column_by_name(&filter.column)
        .ok_or_else(|| Error::InvalidColumn(filter.column.clone()))?;

    if let Some(arr) = column.as_any().downcast_ref::<Int64Array>() {
        let lit = match &filter.literal {
            Literal::Int(v) => *v,
            _ => return Err(Error::InvalidFilter(format!(
                "column {:?} is int64 but literal is not", filter.column
            ))),
        };
        Ok(BooleanArray::from(
            arr.iter()
                .map(|v| v.map(|v| compare(v, lit, filter.op)))
                .collect::<Vec<_>>(),
        ))
    } else if let Some(arr) = column.as_any().downcast_ref::<Float64Array>() {
        let lit = match &filter.literal {
            Literal::Float(v) => *v,
            Literal::Int(v) => *v as f64,
            _ => return Err(Error::InvalidFilter(format!(
                "column {:?} is float64 but literal is not", filter.column
            ))),
        };
        Ok(BooleanArray::from(
            arr.iter()
                .map(|v| v.map(|v| compare_f64(v, lit, filter.op)))
                .collect::<Vec<_>>(),
        ))
    } else if let Some(arr) = column.as_any().downcast_ref::<StringArray>() {
        let lit = match &filter.literal {
            Literal::Str(v) => v.as_str(),
            _ => return Err(Error::InvalidFilter(format!(
                "column {:?} is utf8 but literal is not", filter.column
            ))),
        };
        Ok(BooleanArray::from(
            arr.iter()
                .map(|v| v.map(|v| compare(v, lit, filter.op)))
                .collect::<Vec<_>>(),
        ))
    } else if let Some(arr) = column.as_any().downcast_ref::<BooleanArray>() {
        let lit = match &filter.literal {
            Literal::Bool(v) => *v,
            _ => return Err(Error::InvalidFilter(format!(
                "column {:?} is bool but literal is not", filter.column
            ))),
        };
        if !matches!(filter.op, FilterOp::Eq | FilterOp::Ne) {
            return Err(Error::InvalidFilter(format!(
                "boolean column {:?} only supports = and !=", filter.column
            )));
        }
        Ok(BooleanArray::from(
            arr.iter()
                .map(|v| v.map(|v| compare(v, lit, filter.op)))
                .collect::<Vec<_>>(),
        ))
    } else {
        Err(Error::InvalidFilter(format!(
            "column {:?} has an unsupported type for filtering", filter.column
        )))
    }
}

fn compare<T: PartialOrd + PartialEq>(value: T, literal: T, op: FilterOp) -> bool {
    match op {
        FilterOp::Eq => value == literal,
        FilterOp::Ne => value != literal,
        FilterOp::Lt => value < literal,
        FilterOp::Le => value <= literal,
        FilterOp::Gt => value > literal,
        FilterOp::Ge => value >= literal,
    }
}

fn compare_f64(value: f64, literal: f64, op: FilterOp) -> bool {
    match op {
        FilterOp::Eq => value == literal,
        FilterOp::Ne => value != literal,
        FilterOp::Lt => value < literal,
        FilterOp::Le => value <= literal,
        FilterOp::Gt => value > literal,
        FilterOp::Ge => value >= literal,
    }
}
