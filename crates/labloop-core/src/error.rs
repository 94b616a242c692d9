//! Error types for labloop-core.

use std::fmt;

use thiserror::Error;

/// Where in a tick a user-supplied callback failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ApplyCondition,
    Measure,
    Logger,
    Plot,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::ApplyCondition => write!(f, "apply_condition"),
            Stage::Measure => write!(f, "measure"),
            Stage::Logger => write!(f, "logger"),
            Stage::Plot => write!(f, "plot"),
        }
    }
}

#[derive(Error, Debug)]
pub enum LabError {
    #[error("schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: String, found: String },

    #[error("{stage} failed: {source}")]
    MeasurementFailure {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid experiment setup: {0}")]
    Construction(String),

    #[error("no run to stop or wait for")]
    NotRunning,

    #[error("tick task ended abnormally: {0}")]
    TickTask(String),

    #[error("cannot block on a run from inside an async runtime; call from a plain thread")]
    AsyncContext,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("CSV error: {0}")]
    Csv(#[from] ::csv::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("{0}")]
    Other(String),
}

impl LabError {
    /// Wrap a callback error. A schema mismatch raised through `?` inside a
    /// callback keeps its own variant.
    pub(crate) fn failure(stage: Stage, source: anyhow::Error) -> Self {
        match source.downcast::<LabError>() {
            Ok(err @ LabError::SchemaMismatch { .. }) => err,
            Ok(other) => LabError::MeasurementFailure {
                stage,
                source: other.into(),
            },
            Err(source) => LabError::MeasurementFailure { stage, source },
        }
    }

    /// The callback stage for a `MeasurementFailure`, `None` otherwise.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            LabError::MeasurementFailure { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LabError>;
