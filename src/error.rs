use std::fmt;
use thiserror::Error;

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Derive,
    Select,
    Split,
    Fit,
    Evaluate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Derive => "derive",
            Stage::Select => "select",
            Stage::Split => "split",
            Stage::Fit => "fit",
            Stage::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("insufficient data during {stage}: need {required} rows, have {available}")]
    InsufficientData {
        stage: Stage,
        required: usize,
        available: usize,
    },

    #[error("labels contain {class_count} distinct class(es) across {rows} rows; need both")]
    DegenerateLabel { class_count: usize, rows: usize },

    #[error("model reports {importances} importance scores for {features} features")]
    FeatureMismatch { features: usize, importances: usize },

    #[error("target column '{0}' is not present in the correlation matrix")]
    UnknownTarget(String),

    #[error("column '{0}' is not present in the feature table")]
    UnknownColumn(String),

    #[error("length mismatch during {stage}: expected {left}, found {right}")]
    LengthMismatch {
        stage: Stage,
        left: usize,
        right: usize,
    },

    #[error("invalid horizons: {0}")]
    InvalidHorizons(String),

    #[error("invalid hyperparameters: {0}")]
    InvalidHyperparameters(String),

    #[error("malformed price series for {instrument}: {detail}")]
    MalformedSeries { instrument: String, detail: String },
}

pub type PipelineResult<T> = Result<T, PipelineError>;
