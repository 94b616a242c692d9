//! Scalar values, column schema and the per-tick measurement record.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{LabError, Result};

/// Name of the elapsed-time column every measurement starts with.
pub const TIME_COLUMN: &str = "time";

/// A scalar produced by a measurement or assigned by a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the value; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(_) => None,
        }
    }

    fn column_type(&self) -> ColumnType {
        match self {
            Value::Int(_) | Value::Float(_) => ColumnType::Float,
            Value::Text(_) => ColumnType::Text,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// Storage kind of a column. Integers are stored as floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Float,
    Text,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Float => write!(f, "float"),
            ColumnType::Text => write!(f, "text"),
        }
    }
}

/// One stored value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Float(f64),
    Text(String),
}

impl Cell {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Float(f) => Some(*f),
            Cell::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Float(_) => None,
            Cell::Text(s) => Some(s),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Float(x) => write!(f, "{x}"),
            Cell::Text(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

/// Ordered column names and types, frozen after a run's first sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Infer the schema of a measurement, promoting integers to float.
    pub fn infer(measurement: &Measurement) -> Self {
        let columns = measurement
            .iter()
            .map(|(name, value)| Column {
                name: name.to_string(),
                kind: value.column_type(),
            })
            .collect();
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Convert a measurement into cells, checking names, order and types.
    pub(crate) fn cells_for(&self, measurement: &Measurement) -> Result<Vec<Cell>> {
        let same_names = measurement.len() == self.columns.len()
            && measurement
                .iter()
                .zip(&self.columns)
                .all(|((name, _), col)| name == col.name);
        if !same_names {
            return Err(LabError::SchemaMismatch {
                expected: self.to_string(),
                found: Schema::infer(measurement).to_string(),
            });
        }

        measurement
            .iter()
            .zip(&self.columns)
            .map(|((name, value), col)| match (col.kind, value) {
                (ColumnType::Float, Value::Float(f)) => Ok(Cell::Float(*f)),
                (ColumnType::Float, Value::Int(i)) => Ok(Cell::Float(*i as f64)),
                (ColumnType::Text, Value::Text(s)) => Ok(Cell::Text(s.clone())),
                _ => Err(LabError::SchemaMismatch {
                    expected: format!("{name}: {}", col.kind),
                    found: format!("{name}: {}", value.column_type()),
                }),
            })
            .collect()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", col.name, col.kind)?;
        }
        write!(f, ")")
    }
}

/// The record built during one tick.
///
/// Starts with `time` and the current condition assignments. The measurement
/// function can only append columns (or overwrite ones it appended itself).
#[derive(Debug, Clone)]
pub struct Measurement {
    entries: Vec<(String, Value)>,
    fixed: usize,
}

impl Measurement {
    pub fn new(time: f64, assignments: &[(String, Value)]) -> Self {
        let mut entries = vec![(TIME_COLUMN.to_string(), Value::Float(time))];
        entries.extend(assignments.iter().cloned());
        let fixed = entries.len();
        Self { entries, fixed }
    }

    /// Elapsed seconds since the start of the run.
    pub fn time(&self) -> f64 {
        self.entries[0].1.as_f64().unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Add a measured column, or replace the value of one added earlier in
    /// this tick. `time` and condition columns cannot be overwritten.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let name = name.into();
        let value = value.into();
        match self.entries.iter().position(|(n, _)| *n == name) {
            Some(idx) if idx < self.fixed => Err(LabError::SchemaMismatch {
                expected: format!("new column instead of `{name}`"),
                found: format!("overwrite of reserved column `{name}`"),
            }),
            Some(idx) => {
                self.entries[idx].1 = value;
                Ok(())
            }
            None => {
                self.entries.push((name, value));
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// One stored sample, as handed to loggers.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    schema: Arc<Schema>,
    cells: Vec<Cell>,
}

impl Row {
    pub(crate) fn new(schema: Arc<Schema>, cells: Vec<Cell>) -> Self {
        Self { schema, cells }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn get(&self, name: &str) -> Option<&Cell> {
        self.schema.index_of(name).map(|i| &self.cells[i])
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Cell::as_f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cell)> + '_ {
        self.schema.names().zip(self.cells.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measurement_starts_with_time_and_conditions() {
        let conds = vec![("v".to_string(), Value::Int(3))];
        let m = Measurement::new(0.25, &conds);
        let names: Vec<_> = m.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["time", "v"]);
        assert_eq!(m.time(), 0.25);
    }

    #[test]
    fn measurement_rejects_overwriting_reserved_columns() {
        let conds = vec![("v".to_string(), Value::Int(3))];
        let mut m = Measurement::new(0.0, &conds);
        assert!(matches!(m.set("time", 1.0), Err(LabError::SchemaMismatch { .. })));
        assert!(matches!(m.set("v", 1.0), Err(LabError::SchemaMismatch { .. })));

        m.set("i", 1.0).unwrap();
        m.set("i", 2.0).unwrap();
        assert_eq!(m.len(), 3);
        assert_eq!(m.get("i"), Some(&Value::Float(2.0)));
    }

    #[test]
    fn schema_inference_promotes_ints() {
        let mut m = Measurement::new(0.0, &[]);
        m.set("x", 0).unwrap();
        m.set("label", "a").unwrap();
        let schema = Schema::infer(&m);
        assert_eq!(schema.to_string(), "(time: float, x: float, label: text)");
    }

    #[test]
    fn float_column_rejects_text() {
        let mut m = Measurement::new(0.0, &[]);
        m.set("x", 1.0).unwrap();
        let schema = Schema::infer(&m);

        let mut bad = Measurement::new(1.0, &[]);
        bad.set("x", "oops").unwrap();
        let err = schema.cells_for(&bad).unwrap_err();
        assert!(err.to_string().contains("x: float"));
    }

    #[test]
    fn value_deserializes_ints_before_floats() {
        let values: Vec<Value> = serde_yaml::from_str("[1, 0.5, volts]").unwrap();
        assert_eq!(
            values,
            vec![Value::Int(1), Value::Float(0.5), Value::Text("volts".into())]
        );
    }
}
