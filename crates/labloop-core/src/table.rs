//! Growable columnar sample buffer.
//!
//! The schema is inferred from the first appended measurement and frozen.
//! Storage is preallocated and doubles in place when full, so appends are
//! amortized O(1). `snapshot()` copies only the logical prefix.

use std::sync::Arc;

use crate::error::{LabError, Result};
use crate::record::{Cell, ColumnType, Measurement, Row, Schema};

/// Smallest capacity allocated on the first append.
pub const MIN_CAPACITY: usize = 2;

/// Values of one column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Float(Vec<f64>),
    Text(Vec<String>),
}

impl ColumnData {
    fn with_capacity(kind: ColumnType, capacity: usize) -> Self {
        match kind {
            ColumnType::Float => ColumnData::Float(Vec::with_capacity(capacity)),
            ColumnType::Text => ColumnData::Text(Vec::with_capacity(capacity)),
        }
    }

    pub fn kind(&self) -> ColumnType {
        match self {
            ColumnData::Float(_) => ColumnType::Float,
            ColumnData::Text(_) => ColumnType::Text,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Float(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cell(&self, idx: usize) -> Option<Cell> {
        match self {
            ColumnData::Float(v) => v.get(idx).map(|f| Cell::Float(*f)),
            ColumnData::Text(v) => v.get(idx).map(|s| Cell::Text(s.clone())),
        }
    }

    fn push(&mut self, cell: Cell) {
        match (self, cell) {
            (ColumnData::Float(v), Cell::Float(f)) => v.push(f),
            (ColumnData::Text(v), Cell::Text(s)) => v.push(s),
            // Cells are produced by `Schema::cells_for`, which checks kinds.
            _ => unreachable!("cell kind checked against schema"),
        }
    }

    /// Move the values into a fresh allocation of `capacity` slots.
    fn reallocate(&mut self, capacity: usize) {
        match self {
            ColumnData::Float(v) => {
                let mut grown = Vec::with_capacity(capacity);
                grown.extend_from_slice(v);
                *v = grown;
            }
            ColumnData::Text(v) => {
                let mut grown = Vec::with_capacity(capacity);
                grown.append(v);
                *v = grown;
            }
        }
    }
}

/// The per-run sample buffer.
#[derive(Debug)]
pub struct SampleTable {
    schema: Option<Arc<Schema>>,
    columns: Vec<ColumnData>,
    len: usize,
    capacity: usize,
    initial_capacity: usize,
}

impl Default for SampleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleTable {
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// A table that allocates `capacity` rows (at least two) on first append.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            schema: None,
            columns: Vec::new(),
            len: 0,
            capacity: 0,
            initial_capacity: capacity.max(MIN_CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated rows; zero until the first append.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_deref()
    }

    /// Validate and copy a measurement into the table.
    ///
    /// The first call freezes the schema. Later calls fail with
    /// `SchemaMismatch` when names, order or kinds differ; the table is left
    /// untouched in that case.
    pub fn append(&mut self, measurement: &Measurement) -> Result<Row> {
        let schema = match &self.schema {
            Some(schema) => Arc::clone(schema),
            None => self.freeze(measurement),
        };
        let cells = schema.cells_for(measurement)?;

        if self.len >= self.capacity {
            self.grow();
        }
        for (column, cell) in self.columns.iter_mut().zip(cells.iter().cloned()) {
            column.push(cell);
        }
        self.len += 1;

        Ok(Row::new(schema, cells))
    }

    fn freeze(&mut self, measurement: &Measurement) -> Arc<Schema> {
        let schema = Arc::new(Schema::infer(measurement));
        self.columns = schema
            .columns()
            .iter()
            .map(|c| ColumnData::with_capacity(c.kind, self.initial_capacity))
            .collect();
        self.capacity = self.initial_capacity;
        self.schema = Some(Arc::clone(&schema));
        schema
    }

    fn grow(&mut self) {
        let capacity = self.capacity * 2;
        for column in &mut self.columns {
            column.reallocate(capacity);
        }
        tracing::trace!(from = self.capacity, to = capacity, "sample table grown");
        self.capacity = capacity;
    }

    /// Copy of every sample appended so far.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            schema: self.schema.clone().unwrap_or_default(),
            columns: self.columns.clone(),
            len: self.len,
        }
    }
}

/// Immutable copy of a table's logical contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    schema: Arc<Schema>,
    columns: Vec<ColumnData>,
    len: usize,
}

impl Snapshot {
    /// Build a snapshot from whole columns, e.g. when reading a log back.
    pub fn from_columns(schema: Schema, columns: Vec<ColumnData>) -> Result<Self> {
        if schema.len() != columns.len() {
            return Err(LabError::SchemaMismatch {
                expected: format!("{} columns", schema.len()),
                found: format!("{} columns", columns.len()),
            });
        }
        for (col, data) in schema.columns().iter().zip(&columns) {
            if col.kind != data.kind() {
                return Err(LabError::SchemaMismatch {
                    expected: format!("{}: {}", col.name, col.kind),
                    found: format!("{}: {}", col.name, data.kind()),
                });
            }
        }
        let len = columns.first().map(ColumnData::len).unwrap_or(0);
        if columns.iter().any(|c| c.len() != len) {
            return Err(LabError::Other("columns have different lengths".into()));
        }
        Ok(Self {
            schema: Arc::new(schema),
            columns,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &ColumnData)> + '_ {
        self.schema.names().zip(self.columns.iter())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.schema.index_of(name).map(|i| &self.columns[i])
    }

    pub fn floats(&self, name: &str) -> Option<&[f64]> {
        match self.column(name)? {
            ColumnData::Float(v) => Some(v),
            ColumnData::Text(_) => None,
        }
    }

    pub fn texts(&self, name: &str) -> Option<&[String]> {
        match self.column(name)? {
            ColumnData::Text(v) => Some(v),
            ColumnData::Float(_) => None,
        }
    }

    pub fn row(&self, idx: usize) -> Option<Row> {
        if idx >= self.len {
            return None;
        }
        let cells = self
            .columns
            .iter()
            .map(|c| c.cell(idx))
            .collect::<Option<Vec<_>>>()?;
        Some(Row::new(Arc::clone(&self.schema), cells))
    }

    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        (0..self.len).filter_map(move |i| self.row(i))
    }
}
