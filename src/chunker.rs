//! Splits a table into row ranges sized so each chunk's uncompressed
//! Parquet payload is roughly a target byte count — or, if the caller
//! pins a row count, by that row count directly.

use arrow::array::RecordBatch;

use crate::codec::encode_batch;
use crate::error::{Error, Result};
use crate::table::Table;

pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 64 * 1024 * 1024;
pub const MIN_ROWS_PER_CHUNK: u64 = 1_000;
pub const MAX_ROWS_PER_CHUNK: u64 = 10_000_000;
const SAMPLE_ROWS: usize = 1_000;

/// Split `table` into row-contiguous chunks. Rejects empty tables.
pub fn chunk_table(
    table: &Table,
    chunk_size_bytes: u64,
    chunk_size_rows: Option<u64>,
) -> Result<Vec<RecordBatch>> {
    let total_rows = table.num_rows();
    if total_rows == 0 {
        return Err(Error::EmptyTable);
    }
    let batch = table.to_single_batch()?;

    let rows_per_chunk = match chunk_size_rows {
        Some(rows) => rows.max(1),
        None => estimate_rows_per_chunk(&batch, chunk_size_bytes)?,
    };

    if total_rows as u64 <= rows_per_chunk {
        return Ok(vec![batch]);
    }

    let mut chunks = Vec::new();
    let mut offset = 0usize;
    let step = rows_per_chunk as usize;
    while offset < total_rows {
        let len = step.min(total_rows - offset);
        chunks.push(batch.slice(offset, len));
        offset += len;
    }
    Ok(chunks)
}

/// Encode a `chunk_size_bytes`-sized sample of up to `SAMPLE_ROWS` rows to
/// Parquet, derive bytes/row, and pick a row count yielding a chunk of
/// roughly the target size, clamped to a sane range.
fn estimate_rows_per_chunk(batch: &RecordBatch, chunk_size_bytes: u64) -> Result<u64> {
    let sample_rows = SAMPLE_ROWS.min(batch.num_rows()).max(1);
    let sample = batch.slice(0, sample_rows);
    let encoded = encode_batch(&sample)?;
    let bytes_per_row = (encoded.len() as u64 / sample_rows as u64).max(1);
    let rows_per_chunk = (chunk_size_bytes / bytes_per_row).max(1);
    Ok(rows_per_chunk.clamp(MIN_ROWS_PER_CHUNK, MAX_ROWS_PER_CHUNK))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn table_with_rows(n: i64) -> Table {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from((0..n).collect::<Vec<_>>()))],
        )
        .unwrap();
        Table::try_new(schema, vec![batch]).unwrap()
    }

    #[test]
    fn small_table_is_a_single_chunk() {
        let table = table_with_rows(10);
        let chunks = chunk_table(&table, DEFAULT_CHUNK_SIZE_BYTES, None).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].num_rows(), 10);
    }

    #[test]
    fn fixed_row_count_splits_evenly() {
        let table = table_with_rows(25);
        let chunks = chunk_table(&table, DEFAULT_CHUNK_SIZE_BYTES, Some(10)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].num_rows(), 10);
        assert_eq!(chunks[1].num_rows(), 10);
        assert_eq!(chunks[2].num_rows(), 5);
    }

    #[test]
    fn chunks_cover_every_row_exactly_once() {
        let table = table_with_rows(1234);
        let chunks = chunk_table(&table, DEFAULT_CHUNK_SIZE_BYTES, Some(100)).unwrap();
        let total: usize = chunks.iter().map(RecordBatch::num_rows).sum();
        assert_eq!(total, 1234);
    }

    #[test]
    fn empty_table_is_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let table = Table::empty(schema);
        assert!(matches!(
            chunk_table(&table, DEFAULT_CHUNK_SIZE_BYTES, None),
            Err(Error::EmptyTable)
        ));
    }

    #[test]
    fn byte_estimate_respects_row_clamp() {
        let table = table_with_rows(50_000);
        // A tiny byte target should still clamp up to the minimum rows/chunk.
        let chunks = chunk_table(&table, 1, None).unwrap();
        for chunk in &chunks {
            assert!(chunk.num_rows() as u64 <= MAX_ROWS_PER_CHUNK);
        }
        // With a 1-byte target every chunk should be MIN_ROWS_PER_CHUNK rows
        // (except possibly a shorter final chunk).
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk.num_rows() as u64, MIN_ROWS_PER_CHUNK);
        }
    }
}
