//! Condition sweeps: named input variables stepped through value sequences.
//!
//! A `ConditionSet` pairs every variable with an equally long list of
//! values; row `i` assigns the `i`-th value of each list. The sweep hands the
//! rows out once, in order, and then reports `Exhausted`.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{LabError, Result};
use crate::record::{Value, TIME_COLUMN};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionSet {
    variables: Vec<(String, Vec<Value>)>,
}

impl ConditionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable stepped through `values`, paired by position with the
    /// variables already added.
    pub fn vary<V: Into<Value>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.variables
            .push((name.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Cartesian product of independent axes, expanded into paired form.
    /// The first axis changes slowest.
    pub fn grid(axes: Vec<(String, Vec<Value>)>) -> Self {
        let rows: usize = axes.iter().map(|(_, v)| v.len()).product();
        let mut variables = Vec::with_capacity(axes.len());
        let mut stride = rows;
        for (name, values) in axes {
            let len = values.len();
            stride = if len == 0 { 0 } else { stride / len };
            let expanded = (0..rows)
                .map(|r| values[(r / stride) % len].clone())
                .collect();
            variables.push((name, expanded));
        }
        Self { variables }
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> + '_ {
        self.variables.iter().map(|(n, _)| n.as_str())
    }

    /// Number of condition rows, `None` when no variables are swept.
    pub fn rows(&self) -> Option<usize> {
        self.variables.first().map(|(_, v)| v.len())
    }

    /// Reject mismatched lengths, duplicate names and the reserved `time`.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let expected = self.rows().unwrap_or(0);
        for (name, values) in &self.variables {
            if name == TIME_COLUMN {
                return Err(LabError::Construction(format!(
                    "condition variable may not be named `{TIME_COLUMN}`"
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(LabError::Construction(format!(
                    "condition variable `{name}` given twice"
                )));
            }
            if values.len() != expected {
                return Err(LabError::Construction(format!(
                    "condition variable `{name}` has {} values, expected {expected}",
                    values.len()
                )));
            }
        }
        Ok(())
    }

    fn row(&self, index: usize) -> ConditionRow {
        ConditionRow {
            index,
            assignments: self
                .variables
                .iter()
                .map(|(name, values)| (name.clone(), values[index].clone()))
                .collect(),
        }
    }
}

impl FromIterator<(String, Vec<Value>)> for ConditionSet {
    fn from_iter<I: IntoIterator<Item = (String, Vec<Value>)>>(iter: I) -> Self {
        Self {
            variables: iter.into_iter().collect(),
        }
    }
}

/// One assignment of values to every swept variable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionRow {
    index: usize,
    assignments: Vec<(String, Value)>,
}

impl ConditionRow {
    /// Position of the row in the sweep.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn assignments(&self) -> &[(String, Value)] {
        &self.assignments
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.assignments
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SweepStep {
    Row(ConditionRow),
    Exhausted,
}

/// How many ticks each condition row is held for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatLimit {
    Count(u64),
    Unbounded,
}

impl RepeatLimit {
    /// One tick per row with conditions, never advance without.
    pub fn default_for(conditions: &ConditionSet) -> Self {
        if conditions.is_empty() {
            RepeatLimit::Unbounded
        } else {
            RepeatLimit::Count(1)
        }
    }

    pub fn reached(self, count: u64) -> bool {
        match self {
            RepeatLimit::Count(limit) => count >= limit,
            RepeatLimit::Unbounded => false,
        }
    }

    /// Counter value that forces a row change on the next tick.
    pub(crate) fn saturated(self) -> u64 {
        match self {
            RepeatLimit::Count(limit) => limit,
            RepeatLimit::Unbounded => 0,
        }
    }
}

/// Cursor over a validated `ConditionSet`.
#[derive(Debug, Clone)]
pub struct ConditionSweep {
    set: Arc<ConditionSet>,
    cursor: usize,
}

impl ConditionSweep {
    pub fn new(set: ConditionSet) -> Result<Self> {
        set.validate()?;
        Ok(Self {
            set: Arc::new(set),
            cursor: 0,
        })
    }

    pub fn conditions(&self) -> &ConditionSet {
        &self.set
    }

    /// Total rows, `None` for the unbounded empty sweep.
    pub fn len(&self) -> Option<usize> {
        self.set.rows()
    }

    pub fn is_unbounded(&self) -> bool {
        self.set.is_empty()
    }

    /// Rows handed out since the last reset.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn next_row(&mut self) -> SweepStep {
        match self.set.rows() {
            None => {
                self.cursor += 1;
                SweepStep::Row(ConditionRow {
                    index: self.cursor - 1,
                    assignments: Vec::new(),
                })
            }
            Some(rows) if self.cursor < rows => {
                let row = self.set.row(self.cursor);
                self.cursor += 1;
                SweepStep::Row(row)
            }
            Some(_) => SweepStep::Exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(step: SweepStep) -> Option<Vec<Value>> {
        match step {
            SweepStep::Row(row) => Some(row.assignments().iter().map(|(_, v)| v.clone()).collect()),
            SweepStep::Exhausted => None,
        }
    }

    #[test]
    fn paired_rows_in_order_then_exhausted() {
        let set = ConditionSet::new()
            .vary("v", [1, 2, 3])
            .vary("mode", ["a", "b", "c"]);
        let mut sweep = ConditionSweep::new(set).unwrap();
        assert_eq!(sweep.len(), Some(3));
        assert_eq!(values(sweep.next_row()), Some(vec![Value::Int(1), Value::from("a")]));
        assert_eq!(values(sweep.next_row()), Some(vec![Value::Int(2), Value::from("b")]));
        assert_eq!(values(sweep.next_row()), Some(vec![Value::Int(3), Value::from("c")]));
        assert_eq!(sweep.next_row(), SweepStep::Exhausted);
        assert_eq!(sweep.next_row(), SweepStep::Exhausted);

        sweep.reset();
        assert_eq!(values(sweep.next_row()), Some(vec![Value::Int(1), Value::from("a")]));
    }

    #[test]
    fn empty_set_never_exhausts() {
        let mut sweep = ConditionSweep::new(ConditionSet::new()).unwrap();
        assert!(sweep.is_unbounded());
        for _ in 0..1000 {
            assert_eq!(values(sweep.next_row()), Some(vec![]));
        }
    }

    #[test]
    fn unequal_lengths_fail_eagerly() {
        let set = ConditionSet::new().vary("a", [1, 2]).vary("b", [1, 2, 3]);
        let err = ConditionSweep::new(set).unwrap_err();
        assert!(matches!(err, LabError::Construction(_)));
    }

    #[test]
    fn reserved_and_duplicate_names_fail() {
        let time = ConditionSet::new().vary("time", [1]);
        assert!(ConditionSweep::new(time).is_err());
        let dup = ConditionSet::new().vary("a", [1]).vary("a", [2]);
        assert!(ConditionSweep::new(dup).is_err());
    }

    #[test]
    fn grid_expands_first_axis_slowest() {
        let set = ConditionSet::grid(vec![
            ("v".into(), vec![Value::Int(1), Value::Int(2)]),
            ("f".into(), vec![Value::Int(10), Value::Int(20), Value::Int(30)]),
        ]);
        let mut sweep = ConditionSweep::new(set).unwrap();
        let mut rows = vec![];
        while let SweepStep::Row(row) = sweep.next_row() {
            rows.push((
                row.get("v").and_then(Value::as_f64).unwrap(),
                row.get("f").and_then(Value::as_f64).unwrap(),
            ));
        }
        assert_eq!(
            rows,
            vec![(1.0, 10.0), (1.0, 20.0), (1.0, 30.0), (2.0, 10.0), (2.0, 20.0), (2.0, 30.0)]
        );
    }

    #[test]
    fn grid_with_empty_axis_has_no_rows() {
        let set = ConditionSet::grid(vec![
            ("v".into(), vec![Value::Int(1)]),
            ("f".into(), vec![]),
        ]);
        let mut sweep = ConditionSweep::new(set).unwrap();
        assert_eq!(sweep.len(), Some(0));
        assert_eq!(sweep.next_row(), SweepStep::Exhausted);
    }

    #[test]
    fn repeat_limits() {
        assert_eq!(RepeatLimit::default_for(&ConditionSet::new()), RepeatLimit::Unbounded);
        let set = ConditionSet::new().vary("v", [1]);
        assert_eq!(RepeatLimit::default_for(&set), RepeatLimit::Count(1));
        assert!(RepeatLimit::Count(2).reached(2));
        assert!(!RepeatLimit::Count(2).reached(1));
        assert!(!RepeatLimit::Unbounded.reached(u64::MAX));
    }
}
