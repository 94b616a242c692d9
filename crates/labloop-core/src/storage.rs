//! Storage layer: Parquet/Arrow sample logs and YAML config files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tracing::debug;

use crate::error::{LabError, Result};
use crate::record::{Column, ColumnType, Measurement, Row, Schema, Value};
use crate::sink::Logger;
use crate::table::{ColumnData, SampleTable, Snapshot};

// ─── YAML config I/O ─────────────────────────────────────────────────────────

pub fn save_yaml<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_yaml::to_string(data)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

// ─── Arrow conversion ────────────────────────────────────────────────────────

impl Snapshot {
    /// Columnar Arrow view of the snapshot (`Float64` / `Utf8`, non-null).
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        snapshot_to_record_batch(self)
    }
}

pub fn snapshot_to_record_batch(snapshot: &Snapshot) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(snapshot.schema().len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(snapshot.schema().len());

    for (name, data) in snapshot.columns() {
        match data {
            ColumnData::Float(values) => {
                fields.push(Field::new(name, DataType::Float64, false));
                arrays.push(Arc::new(Float64Array::from(values.clone())));
            }
            ColumnData::Text(values) => {
                fields.push(Field::new(name, DataType::Utf8, false));
                arrays.push(Arc::new(StringArray::from(values.clone())));
            }
        }
    }

    let schema = Arc::new(ArrowSchema::new(fields));
    if arrays.is_empty() {
        return Ok(RecordBatch::new_empty(schema));
    }
    Ok(RecordBatch::try_new(schema, arrays)?)
}

pub fn record_batch_to_snapshot(batch: &RecordBatch) -> Result<Snapshot> {
    let mut columns = Vec::with_capacity(batch.num_columns());
    let mut data = Vec::with_capacity(batch.num_columns());

    for (field, array) in batch.schema().fields().iter().zip(batch.columns()) {
        if array.null_count() > 0 {
            return Err(LabError::Other(format!(
                "column `{}` contains nulls",
                field.name()
            )));
        }
        match field.data_type() {
            DataType::Float64 => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| LabError::Other(format!("bad Float64 column `{}`", field.name())))?;
                columns.push(Column {
                    name: field.name().clone(),
                    kind: ColumnType::Float,
                });
                data.push(ColumnData::Float(arr.values().to_vec()));
            }
            DataType::Utf8 => {
                let arr = array
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| LabError::Other(format!("bad Utf8 column `{}`", field.name())))?;
                columns.push(Column {
                    name: field.name().clone(),
                    kind: ColumnType::Text,
                });
                data.push(ColumnData::Text(
                    arr.iter().map(|v| v.unwrap_or_default().to_string()).collect(),
                ));
            }
            other => {
                return Err(LabError::Other(format!(
                    "unsupported column type {other} for `{}`",
                    field.name()
                )))
            }
        }
    }

    Snapshot::from_columns(Schema::new(columns), data)
}

// ─── Parquet I/O ─────────────────────────────────────────────────────────────

pub fn write_parquet(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let batch = snapshot.to_record_batch()?;
    let file = fs::File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

pub fn read_parquet(path: &Path) -> Result<Snapshot> {
    let file = fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = builder.schema().clone();
    let reader = builder.build()?;
    let mut batches = vec![];
    for batch in reader {
        batches.push(batch?);
    }
    let batch = match batches.len() {
        0 => RecordBatch::new_empty(schema),
        1 => batches.remove(0),
        _ => arrow::compute::concat_batches(&schema, &batches)?,
    };
    record_batch_to_snapshot(&batch)
}

// ─── Parquet logger ──────────────────────────────────────────────────────────

/// Logger that keeps its own copy of the run and rewrites a Parquet file
/// every `flush_interval_rows` rows and when the run finishes.
#[derive(Debug)]
pub struct ParquetLogger {
    path: PathBuf,
    flush_interval_rows: usize,
    table: SampleTable,
    pending: usize,
}

impl ParquetLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flush_interval_rows: 50,
            table: SampleTable::new(),
            pending: 0,
        }
    }

    pub fn with_flush_interval(mut self, rows: usize) -> Self {
        self.flush_interval_rows = rows.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&mut self) -> Result<()> {
        write_parquet(&self.path, &self.table.snapshot())?;
        debug!(path = %self.path.display(), rows = self.table.len(), "parquet log flushed");
        self.pending = 0;
        Ok(())
    }
}

/// Rebuild a measurement from a stored row so it can be re-appended.
fn row_to_measurement(row: &Row) -> Measurement {
    let assignments: Vec<(String, Value)> = row
        .iter()
        .skip(1)
        .map(|(name, cell)| {
            let value = match cell.as_f64() {
                Some(f) => Value::Float(f),
                None => Value::Text(cell.to_string()),
            };
            (name.to_string(), value)
        })
        .collect();
    Measurement::new(row.cells()[0].as_f64().unwrap_or_default(), &assignments)
}

impl Logger for ParquetLogger {
    fn start(&mut self, _first: &Row) -> anyhow::Result<()> {
        self.table = SampleTable::new();
        self.pending = 0;
        Ok(())
    }

    fn log(&mut self, row: &Row) -> anyhow::Result<()> {
        self.table.append(&row_to_measurement(row))?;
        self.pending += 1;
        if self.pending >= self.flush_interval_rows {
            self.flush()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if self.pending > 0 {
            self.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table() -> SampleTable {
        let mut table = SampleTable::new();
        for i in 0..5 {
            let mut m = Measurement::new(i as f64 * 0.1, &[("mode".into(), Value::from("dc"))]);
            m.set("current", i as f64 * 1e-3).unwrap();
            table.append(&m).unwrap();
        }
        table
    }

    #[test]
    fn parquet_round_trip_keeps_schema_and_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("samples.parquet");
        let snap = table().snapshot();
        write_parquet(&path, &snap).unwrap();
        assert_eq!(read_parquet(&path).unwrap(), snap);
    }

    #[test]
    fn record_batch_has_typed_columns() {
        let batch = table().snapshot().to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 5);
        let schema = batch.schema();
        assert_eq!(schema.field(0).name(), "time");
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(2).data_type(), &DataType::Float64);
    }

    #[test]
    fn parquet_logger_flushes_in_batches_and_on_finish() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.parquet");
        let mut logger = ParquetLogger::new(&path).with_flush_interval(2);
        let snap = table().snapshot();

        let mut rows = snap.rows();
        let first = rows.next().unwrap();
        logger.start(&first).unwrap();
        logger.log(&first).unwrap();
        assert!(!path.exists());
        logger.log(&rows.next().unwrap()).unwrap();
        assert_eq!(read_parquet(&path).unwrap().len(), 2);

        for row in rows {
            logger.log(&row).unwrap();
        }
        logger.finish().unwrap();
        assert_eq!(read_parquet(&path).unwrap(), snap);
    }
}
