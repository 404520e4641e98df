//! The Arrow boundary. The core speaks only `RecordBatch`/`Table`
//! internally; any DataFrame-native caller converts through `IntoArrow`.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;

use crate::error::{Error, Result};

/// A logical table: one schema, zero or more row-batches.
#[derive(Debug, Clone)]
pub struct Table {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl Table {
    pub fn try_new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        for batch in &batches {
            if batch.schema() != schema {
                return Err(Error::InvalidColumn(
                    "batch schema does not match table schema".into(),
                ));
            }
        }
        Ok(Self { schema, batches })
    }

    pub fn empty(schema: SchemaRef) -> Self {
        Self { schema, batches: Vec::new() }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    pub fn num_columns(&self) -> usize {
        self.schema.fields().len()
    }

    /// Materialize the whole table as one contiguous batch.
    pub fn to_single_batch(&self) -> Result<RecordBatch> {
        if self.batches.is_empty() {
            return Ok(RecordBatch::new_empty(self.schema.clone()));
        }
        if self.batches.len() == 1 {
            return Ok(self.batches[0].clone());
        }
        Ok(concat_batches(&self.schema, &self.batches)?)
    }
}

/// Boundary conversion trait: DataFrame-native callers implement this to
/// hand the core an Arrow table without the core knowing their type.
pub trait IntoArrow {
    fn into_arrow(self) -> Result<Table>;
}

impl IntoArrow for Table {
    fn into_arrow(self) -> Result<Table> {
        Ok(self)
    }
}

impl IntoArrow for RecordBatch {
    fn into_arrow(self) -> Result<Table> {
        let schema = self.schema();
        Table::try_new(schema, vec![self])
    }
}

impl IntoArrow for Vec<RecordBatch> {
    fn into_arrow(self) -> Result<Table> {
        let schema: SchemaRef = self
            .first()
            .map(|b| b.schema())
            .unwrap_or_else(|| Arc::new(arrow::datatypes::Schema::empty()));
        Table::try_new(schema, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn sample_batch(rows: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(rows.to_vec()))]).unwrap()
    }

    #[test]
    fn single_batch_passthrough() {
        let batch = sample_batch(&[1, 2, 3]);
        let table = batch.clone().into_arrow().unwrap();
        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.to_single_batch().unwrap(), batch);
    }

    #[test]
    fn multi_batch_concatenates() {
        let b1 = sample_batch(&[1, 2]);
        let b2 = sample_batch(&[3, 4]);
        let table = vec![b1, b2].into_arrow().unwrap();
        assert_eq!(table.num_rows(), 4);
        assert_eq!(table.to_single_batch().unwrap().num_rows(), 4);
    }

    #[test]
    fn mismatched_schema_rejected() {
        let schema_a = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let schema_b = Arc::new(Schema::new(vec![Field::new("name", DataType::Utf8, false)]));
        let batch = RecordBatch::new_empty(schema_b);
        assert!(Table::try_new(schema_a, vec![batch]).is_err());
    }
}
