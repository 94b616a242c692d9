//! labloop-core: experiment loop, condition sweeps and sample storage.
//!
//! An `Experiment` calls a measurement function on a fixed period from a
//! dedicated tokio runtime thread, steps a `ConditionSweep` through its rows,
//! accumulates every `Measurement` in a typed, column-oriented `SampleTable`
//! and fans each row out to `Logger` and `PlotSink` implementations
//! (CSV, Parquet, SVG, progress spinner).

pub mod csv;
pub mod engine;
pub mod error;
pub mod models;
pub mod plot;
pub mod record;
pub mod sink;
pub mod storage;
pub mod sweep;
pub mod table;

pub use self::csv::{read_csv, write_csv, CsvLogger};
pub use engine::{Experiment, ExperimentBuilder, StopHandle};
pub use error::{LabError, Result, Stage};
pub use models::{ExperimentConfig, RunStatus, RunSummary};
pub use plot::{ProgressPlot, SvgPlotter};
pub use record::{Cell, ColumnType, Measurement, Row, Schema, Value, TIME_COLUMN};
pub use sink::{Logger, PlotSink};
pub use storage::{read_parquet, write_parquet, ParquetLogger};
pub use sweep::{ConditionRow, ConditionSet, ConditionSweep, RepeatLimit, SweepStep};
pub use table::{ColumnData, SampleTable, Snapshot};
