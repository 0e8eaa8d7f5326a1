use std::fmt;

use once_cell::sync::Lazy;
use polars::prelude::DataFrame;

use crate::config::StepArgs;
use crate::error::{PipelineError, Result};
use crate::steps::{evaluations, transformations};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Transformation,
    Evaluation,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Transformation => f.write_str("transformation"),
            StepKind::Evaluation => f.write_str("evaluation"),
        }
    }
}

/// Maps the current dataset to the next one.
pub type TransformationFn = fn(DataFrame, &StepArgs) -> Result<DataFrame>;

/// Returns `true` when the check it describes has failed.
pub type EvaluationFn = fn(&DataFrame, &StepArgs) -> Result<bool>;

#[derive(Debug, Clone)]
pub struct StepDescriptor<F> {
    pub name: &'static str,
    pub description: &'static str,
    pub call: F,
}

/// Name -> function table for one kind of step.
#[derive(Debug, Clone)]
pub struct StepRegistry<F: Copy> {
    kind: StepKind,
    steps: Vec<StepDescriptor<F>>,
}

pub type TransformationRegistry = StepRegistry<TransformationFn>;
pub type EvaluationRegistry = StepRegistry<EvaluationFn>;

impl<F: Copy> StepRegistry<F> {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            steps: Vec::new(),
        }
    }

    /// Registers `call` under `name`, replacing any earlier step of that name.
    pub fn with_step(mut self, name: &'static str, description: &'static str, call: F) -> Self {
        self.steps.retain(|step| step.name != name);
        self.steps.push(StepDescriptor {
            name,
            description,
            call,
        });
        self
    }

    pub fn resolve(&self, name: &str) -> Result<F> {
        self.steps
            .iter()
            .find(|step| step.name == name)
            .map(|step| step.call)
            .ok_or_else(|| PipelineError::UnknownStep {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    pub fn descriptors(&self) -> &[StepDescriptor<F>] {
        &self.steps
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }
}

static TRANSFORMATIONS: Lazy<TransformationRegistry> = Lazy::new(|| {
    TransformationRegistry::new(StepKind::Transformation)
        .with_step(
            "format_date_columns",
            "Converts the listed columns to calendar dates",
            transformations::format_date_columns,
        )
        .with_step(
            "drop_rows_with_any_null_values",
            "Drops every row that contains a null",
            transformations::drop_rows_with_any_null_values,
        )
        .with_step(
            "drop_duplicate_rows",
            "Drops duplicate rows, optionally over a column subset",
            transformations::drop_duplicate_rows,
        )
        .with_step(
            "filter_by_date_range",
            "Keeps rows whose date lies inside an inclusive range",
            transformations::filter_by_date_range,
        )
        .with_step(
            "agg_insert_by_group",
            "Appends one aggregate row per group",
            transformations::agg_insert_by_group,
        )
        .with_step(
            "rolling_mean_by_date_by_group",
            "Adds trailing rolling means per group",
            transformations::rolling_mean_by_date_by_group,
        )
        .with_step(
            "yoy_percent_change_by_group",
            "Adds 365-row percent change per group",
            transformations::yoy_percent_change_by_group,
        )
        .with_step(
            "fill_missing_dates_by_group",
            "Reindexes each group to every day of a range",
            transformations::fill_missing_dates_by_group,
        )
});

static EVALUATIONS: Lazy<EvaluationRegistry> = Lazy::new(|| {
    EvaluationRegistry::new(StepKind::Evaluation)
        .with_step(
            "null_data_check",
            "Fails when any value is null",
            evaluations::null_data_check,
        )
        .with_step(
            "date_range_check",
            "Fails when any date falls outside the range",
            evaluations::date_range_check,
        )
        .with_step(
            "date_range_check_by_group",
            "Fails when any group has a date outside the range",
            evaluations::date_range_check_by_group,
        )
        .with_step(
            "date_coverage_check",
            "Fails when the dates do not span the whole range",
            evaluations::date_coverage_check,
        )
        .with_step(
            "date_continuity_check",
            "Fails when consecutive dates are more than a day apart",
            evaluations::date_continuity_check,
        )
        .with_step(
            "date_continuity_check_by_group",
            "Fails when any group has a gap in its dates",
            evaluations::date_continuity_check_by_group,
        )
});

pub fn builtin_transformations() -> &'static TransformationRegistry {
    &TRANSFORMATIONS
}

pub fn builtin_evaluations() -> &'static EvaluationRegistry {
    &EVALUATIONS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_failed(_: &DataFrame, _: &StepArgs) -> Result<bool> {
        Ok(true)
    }

    #[test]
    fn builtin_names_resolve() {
        assert!(builtin_transformations()
            .resolve("drop_rows_with_any_null_values")
            .is_ok());
        assert!(builtin_evaluations().resolve("date_range_check").is_ok());
        assert_eq!(builtin_transformations().descriptors().len(), 8);
        assert_eq!(builtin_evaluations().descriptors().len(), 6);
    }

    #[test]
    fn registries_are_independent() {
        // An evaluation name is not a transformation.
        match builtin_transformations().resolve("null_data_check") {
            Err(PipelineError::UnknownStep { kind, name }) => {
                assert_eq!(kind, StepKind::Transformation);
                assert_eq!(name, "null_data_check");
            }
            other => panic!("unexpected resolution: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let registry = builtin_evaluations()
            .clone()
            .with_step("null_data_check", "override", always_failed);
        assert_eq!(registry.descriptors().len(), 6);

        let check = registry.resolve("null_data_check").unwrap();
        let df = DataFrame::empty();
        assert!(check(&df, &StepArgs::default()).unwrap());
    }
}
