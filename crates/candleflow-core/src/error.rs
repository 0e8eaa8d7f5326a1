// crates/candleflow-core/src/error.rs

use std::path::PathBuf;

use thiserror::Error;

use crate::registry::StepKind;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("File extension {extension} not recognized for {}", path.display())]
    UnsupportedFormat { extension: String, path: PathBuf },

    #[error("Pipeline {name} version {version} not found in {}", home.display())]
    PipelineNotFound {
        name: String,
        version: String,
        home: PathBuf,
    },

    #[error(
        "Pipeline {name} version {version} already exists in {}; delete or overwrite it",
        home.display()
    )]
    PipelineExists {
        name: String,
        version: String,
        home: PathBuf,
    },

    #[error("unknown {kind} step {name:?}")]
    UnknownStep { kind: StepKind, name: String },

    #[error("invalid arguments for step {step}: {source}")]
    InvalidStepArguments {
        step: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("step {step} failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("cannot cast column {column} to {dtype}: {reason}")]
    SchemaCastError {
        column: String,
        dtype: String,
        reason: String,
    },

    #[error(
        "evaluations failed for load control key {load_control_key}: {}",
        failed.join(", ")
    )]
    EvaluationFailed {
        load_control_key: String,
        failed: Vec<String>,
    },

    #[error("no staged dataset for load control key {load_control_key} at {}", path.display())]
    StagedDatasetMissing {
        load_control_key: String,
        path: PathBuf,
    },

    #[error("invalid load control key {key:?}")]
    InvalidLoadControlKey { key: String },

    #[error("load control key {load_control_key} is locked by another run")]
    RunLocked { load_control_key: String },

    #[error("failed to move {} to {}: {source}", from.display(), to.display())]
    Promotion {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} failed with the following error:\n\n{detail}")]
    StageLoggedFailure {
        stage: String,
        detail: String,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars operation failed: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid glob pattern: {0}")]
    GlobPattern(#[from] glob::PatternError),
}

impl PipelineError {
    /// Unwraps any `StageLoggedFailure` layers and returns the failure that started it.
    pub fn root_cause(&self) -> &PipelineError {
        let mut current = self;
        while let PipelineError::StageLoggedFailure { source, .. } = current {
            current = source;
        }
        current
    }

    pub fn evaluation_failures(&self) -> Option<&[String]> {
        match self.root_cause() {
            PipelineError::EvaluationFailed { failed, .. } => Some(failed.as_slice()),
            _ => None,
        }
    }

    pub(crate) fn step_failed(step: &str, message: impl Into<String>) -> Self {
        PipelineError::StepFailed {
            step: step.to_string(),
            message: message.into(),
        }
    }
}

/// Renders an error followed by its full `source()` chain.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str("\n\nCaused by:\n    ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_unwraps_nested_stage_failures() {
        let inner = PipelineError::UnknownStep {
            kind: StepKind::Transformation,
            name: "nonexistent_step".into(),
        };
        let wrapped = PipelineError::StageLoggedFailure {
            stage: "inner".into(),
            detail: inner.to_string(),
            source: Box::new(inner),
        };
        let outer = PipelineError::StageLoggedFailure {
            stage: "outer".into(),
            detail: wrapped.to_string(),
            source: Box::new(wrapped),
        };

        assert!(matches!(
            outer.root_cause(),
            PipelineError::UnknownStep { name, .. } if name == "nonexistent_step"
        ));
        assert!(outer.evaluation_failures().is_none());
    }

    #[test]
    fn evaluation_failed_lists_every_check() {
        let err = PipelineError::EvaluationFailed {
            load_control_key: "2021-03".into(),
            failed: vec!["null_data_check".into(), "date_range_check".into()],
        };
        let message = err.to_string();
        assert!(message.contains("null_data_check, date_range_check"));
        assert_eq!(
            err.evaluation_failures(),
            Some(&["null_data_check".to_string(), "date_range_check".to_string()][..])
        );
    }

    #[test]
    fn error_chain_includes_sources() {
        let source = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err = PipelineError::InvalidStepArguments {
            step: "drop_duplicate_rows".into(),
            source,
        };
        let rendered = error_chain(&err);
        assert!(rendered.starts_with("invalid arguments for step drop_duplicate_rows"));
        assert!(rendered.contains("Caused by:"));
    }
}
