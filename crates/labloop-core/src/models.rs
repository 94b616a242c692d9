//! Experiment configuration and run summaries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LabError, Result};
use crate::record::Value;
use crate::storage;
use crate::sweep::ConditionSet;

/// Configuration for an experiment, usually loaded from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Name of the experiment (e.g. "diode_iv")
    pub name: String,
    /// Seconds between tick starts; 0 runs ticks back to back
    #[serde(default)]
    pub interval_secs: f64,
    /// Ticks per condition row (default: 1 with conditions, unbounded without)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurements_per_condition: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionSpec>,
    /// Expand `conditions` as a cartesian grid instead of pairing by position
    #[serde(default)]
    pub grid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv: Option<CsvConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parquet: Option<ParquetConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<PlotConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub variable: String,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvConfig {
    pub path: PathBuf,
    #[serde(default = "default_separator")]
    pub separator: char,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetConfig {
    pub path: PathBuf,
    /// Rewrite the file every N rows (default: 50)
    #[serde(default = "default_flush_rows")]
    pub flush_interval_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotConfig {
    pub path: PathBuf,
    /// Columns to plot against time (default: all but `time`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Redraw on every N-th tick (default: 1)
    #[serde(default = "default_every")]
    pub every: usize,
}

fn default_separator() -> char {
    ','
}
fn default_flush_rows() -> usize {
    50
}
fn default_width() -> u32 {
    1024
}
fn default_height() -> u32 {
    768
}
fn default_every() -> usize {
    1
}

impl ExperimentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval_secs: 0.0,
            measurements_per_condition: None,
            conditions: Vec::new(),
            grid: false,
            csv: None,
            parquet: None,
            plot: None,
        }
    }

    pub fn with_interval(mut self, secs: f64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn with_condition<V: Into<Value>>(
        mut self,
        variable: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.conditions.push(ConditionSpec {
            variable: variable.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn interval(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.interval_secs).map_err(|_| {
            LabError::Construction(format!(
                "interval must be a non-negative number of seconds, got {}",
                self.interval_secs
            ))
        })
    }

    pub fn condition_set(&self) -> ConditionSet {
        let axes = self
            .conditions
            .iter()
            .map(|c| (c.variable.clone(), c.values.clone()));
        if self.grid {
            ConditionSet::grid(axes.collect())
        } else {
            axes.collect()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        storage::load_yaml(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        storage::save_yaml(path, self)
    }
}

/// How a run that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    /// Every condition row was measured.
    Completed,
    /// Stopped from outside before the sweep ran out.
    Stopped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "COMPLETED"),
            RunStatus::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Outcome of a run that ended without error.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub experiment: String,
    pub status: RunStatus,
    pub samples: usize,
    /// Condition rows applied (0 when nothing is swept)
    pub conditions_applied: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: diode_iv
interval_secs: 0.5
measurements_per_condition: 3
conditions:
  - variable: bias
    values: [0, 0.1, 0.2]
  - variable: range
    values: [auto, auto, "10mA"]
csv:
  path: iv.csv
  separator: ";"
plot:
  path: iv.svg
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let config: ExperimentConfig = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(config.name, "diode_iv");
        assert_eq!(config.interval().unwrap(), Duration::from_millis(500));
        assert_eq!(config.measurements_per_condition, Some(3));
        assert_eq!(config.conditions[0].values[0], Value::Int(0));
        assert_eq!(config.conditions[1].values[2], Value::from("10mA"));
        assert_eq!(config.csv.as_ref().unwrap().separator, ';');
        let plot = config.plot.as_ref().unwrap();
        assert_eq!((plot.width, plot.height, plot.every), (1024, 768, 1));
        assert!(config.parquet.is_none());
        assert_eq!(config.condition_set().rows(), Some(3));
    }

    #[test]
    fn grid_flag_expands_conditions() {
        let mut config = ExperimentConfig::new("grid")
            .with_condition("a", [1, 2])
            .with_condition("b", [1, 2, 3]);
        assert!(config.condition_set().validate().is_err());
        config.grid = true;
        assert_eq!(config.condition_set().rows(), Some(6));
    }

    #[test]
    fn negative_interval_is_rejected() {
        let config = ExperimentConfig::new("x").with_interval(-1.0);
        assert!(matches!(config.interval(), Err(LabError::Construction(_))));
        let config = ExperimentConfig::new("x").with_interval(f64::NAN);
        assert!(config.interval().is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("exp.yaml");
        let config: ExperimentConfig = serde_yaml::from_str(YAML).unwrap();
        config.save(&path).unwrap();
        assert_eq!(ExperimentConfig::load(&path).unwrap(), config);
    }
}
