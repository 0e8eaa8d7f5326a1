use std::fs;
use std::path::Path;

use anyhow::Result;
use polars::prelude::DataFrame;
use serde_json::{json, Value};

use candleflow_core::lock::RunLock;
use candleflow_core::{
    builtin_evaluations, builtin_transformations, read_dataset, register_pipeline, DatasetStage,
    LogOutcome, LogStage, Pipeline, PipelineConfig, PipelineError, PipelineIdentity, Registration,
    StepArgs,
};

const PRICES_WITH_NULL_ROW: &str = "\
date,symbol,close
2020-01-01,CMG,1.0
2020-01-02,,
2020-01-03,CMG,3.0
";

const PRICES_INTO_2021: &str = "\
date,symbol,close
2020-06-01,CMG,1.0
2021-03-01,CMG,2.0
";

fn config(transformations: Value, evaluations: Value) -> PipelineConfig {
    serde_json::from_value(json!({
        "input_schema": {"close": "float64"},
        "output_schema": {"date": "date", "close": "float64"},
        "transformations": transformations,
        "evaluations": evaluations,
        "visualizations": []
    }))
    .expect("valid config")
}

fn setup(home: &Path, config: PipelineConfig) -> Result<Pipeline> {
    let identity = register_pipeline(&Registration::new(home, "candles", 1, config), false)?;
    Ok(Pipeline::load(identity)?.with_echo(false))
}

fn source(home: &Path, contents: &str) -> Result<std::path::PathBuf> {
    let path = home.join("source.csv");
    fs::write(&path, contents)?;
    Ok(path)
}

fn stage_files(identity: &PipelineIdentity, stage: DatasetStage) -> Result<usize> {
    Ok(fs::read_dir(identity.dataset_dir(stage))?.count())
}

fn assert_single_log(identity: &PipelineIdentity, key: &str, stage: LogStage, expected: LogOutcome) {
    let other = match expected {
        LogOutcome::Success => LogOutcome::Failure,
        LogOutcome::Failure => LogOutcome::Success,
    };
    assert!(identity.log_path(key, stage, expected).exists(), "{expected:?} log missing");
    assert!(!identity.log_path(key, stage, other).exists(), "{other:?} log should not exist");
}

#[test]
fn null_rows_are_dropped_and_dataset_is_promoted() -> Result<()> {
    let home = tempfile::tempdir()?;
    let pipeline = setup(
        home.path(),
        config(
            json!([["drop_rows_with_any_null_values", null]]),
            json!([["null_data_check", null]]),
        ),
    )?;
    let identity = pipeline.identity().clone();
    let src = source(home.path(), PRICES_WITH_NULL_ROW)?;

    let staged = pipeline.ingest_and_transform(&src, "2020-01")?;
    assert_eq!(staged, identity.dataset_path(DatasetStage::Staging, "2020-01"));
    assert_eq!(read_dataset(&staged)?.height(), 2);
    assert_eq!(
        read_dataset(&identity.dataset_path(DatasetStage::Input, "2020-01"))?.height(),
        3
    );
    assert_single_log(&identity, "2020-01", LogStage::Transformation, LogOutcome::Success);

    let output = pipeline.evaluate_and_route("2020-01")?;
    assert_eq!(output, identity.dataset_path(DatasetStage::Output, "2020-01"));
    assert!(output.exists());
    assert!(!staged.exists());
    assert_eq!(stage_files(&identity, DatasetStage::Failed)?, 0);
    assert_single_log(&identity, "2020-01", LogStage::Evaluation, LogOutcome::Success);

    let log = fs::read_to_string(identity.log_path(
        "2020-01",
        LogStage::Transformation,
        LogOutcome::Success,
    ))?;
    assert!(log.contains("Running step: drop_rows_with_any_null_values"));
    assert!(log.contains("drop_rows_with_any_null_values: COMPLETE"));
    assert!(log.contains("blake3"));
    Ok(())
}

#[test]
fn out_of_range_dates_demote_dataset_to_failed() -> Result<()> {
    let home = tempfile::tempdir()?;
    let pipeline = setup(
        home.path(),
        config(
            json!([["drop_rows_with_any_null_values", null]]),
            json!([["date_range_check", {
                "date_range": ["2020-01-01", "2020-12-31"],
                "date_column": "date"
            }]]),
        ),
    )?;
    let identity = pipeline.identity().clone();
    let src = source(home.path(), PRICES_INTO_2021)?;

    pipeline.ingest_and_transform(&src, "2021-03")?;
    let err = pipeline.evaluate_and_route("2021-03").unwrap_err();

    assert_eq!(err.evaluation_failures(), Some(&["date_range_check".to_string()][..]));
    assert!(err.to_string().contains("date_range_check"));
    assert!(identity.dataset_path(DatasetStage::Failed, "2021-03").exists());
    assert!(!identity.dataset_path(DatasetStage::Staging, "2021-03").exists());
    assert!(!identity.dataset_path(DatasetStage::Output, "2021-03").exists());
    assert_single_log(&identity, "2021-03", LogStage::Evaluation, LogOutcome::Failure);
    Ok(())
}

#[test]
fn unknown_transformation_leaves_input_but_no_staging() -> Result<()> {
    let home = tempfile::tempdir()?;
    let pipeline = setup(
        home.path(),
        config(json!([["nonexistent_step", null]]), json!([])),
    )?;
    let identity = pipeline.identity().clone();
    let src = source(home.path(), PRICES_WITH_NULL_ROW)?;

    let err = pipeline.ingest_and_transform(&src, "k1").unwrap_err();
    assert!(matches!(
        err.root_cause(),
        PipelineError::UnknownStep { name, .. } if name == "nonexistent_step"
    ));
    assert!(identity.dataset_path(DatasetStage::Input, "k1").exists());
    assert_eq!(stage_files(&identity, DatasetStage::Staging)?, 0);
    assert_single_log(&identity, "k1", LogStage::Transformation, LogOutcome::Failure);

    let log = fs::read_to_string(identity.log_path("k1", LogStage::Transformation, LogOutcome::Failure))?;
    assert!(log.contains("nonexistent_step"));
    Ok(())
}

#[test]
fn empty_evaluation_list_always_promotes() -> Result<()> {
    let home = tempfile::tempdir()?;
    let pipeline = setup(home.path(), config(json!([]), json!([])))?;
    let identity = pipeline.identity().clone();
    let src = source(home.path(), PRICES_INTO_2021)?;

    pipeline.ingest_and_transform(&src, "any")?;
    pipeline.evaluate_and_route("any")?;
    assert!(identity.dataset_path(DatasetStage::Output, "any").exists());
    assert_eq!(stage_files(&identity, DatasetStage::Staging)?, 0);
    Ok(())
}

fn always_flags(_: &DataFrame, _: &StepArgs) -> candleflow_core::Result<bool> {
    Ok(true)
}

#[test]
fn every_failed_evaluation_is_reported_in_declared_order() -> Result<()> {
    let home = tempfile::tempdir()?;
    let cfg = config(
        json!([]),
        json!([
            ["always_flags", null],
            ["null_data_check", null],
            ["date_continuity_check", {"date_column": "date"}]
        ]),
    );
    let identity = register_pipeline(&Registration::new(home.path(), "candles", 1, cfg.clone()), false)?;
    let evaluations = builtin_evaluations()
        .clone()
        .with_step("always_flags", "test-only check", always_flags);
    let pipeline = Pipeline::with_registries(
        identity.clone(),
        cfg,
        builtin_transformations().clone(),
        evaluations,
    )
    .with_echo(false);
    let src = source(home.path(), PRICES_INTO_2021)?;

    pipeline.ingest_and_transform(&src, "gap")?;
    let err = pipeline.evaluate_and_route("gap").unwrap_err();
    assert_eq!(
        err.evaluation_failures(),
        Some(&["always_flags".to_string(), "date_continuity_check".to_string()][..])
    );
    assert!(identity.dataset_path(DatasetStage::Failed, "gap").exists());
    Ok(())
}

#[test]
fn evaluation_error_leaves_artifact_in_staging() -> Result<()> {
    let home = tempfile::tempdir()?;
    let pipeline = setup(
        home.path(),
        config(json!([]), json!([["date_range_check", {"date_column": "date"}]])),
    )?;
    let identity = pipeline.identity().clone();
    let src = source(home.path(), PRICES_INTO_2021)?;

    pipeline.ingest_and_transform(&src, "bad-args")?;
    let err = pipeline.evaluate_and_route("bad-args").unwrap_err();
    assert!(matches!(err.root_cause(), PipelineError::InvalidStepArguments { .. }));
    assert!(identity.dataset_path(DatasetStage::Staging, "bad-args").exists());
    assert_eq!(stage_files(&identity, DatasetStage::Output)?, 0);
    assert_eq!(stage_files(&identity, DatasetStage::Failed)?, 0);
    Ok(())
}

#[test]
fn routed_dataset_cannot_be_evaluated_twice() -> Result<()> {
    let home = tempfile::tempdir()?;
    let pipeline = setup(home.path(), config(json!([]), json!([])))?;
    let src = source(home.path(), PRICES_INTO_2021)?;

    pipeline.ingest_and_transform(&src, "once")?;
    pipeline.evaluate_and_route("once")?;
    let err = pipeline.evaluate_and_route("once").unwrap_err();
    assert!(matches!(
        err.root_cause(),
        PipelineError::StagedDatasetMissing { load_control_key, .. } if load_control_key == "once"
    ));
    Ok(())
}

#[test]
fn staging_keys_are_listed_sorted() -> Result<()> {
    let home = tempfile::tempdir()?;
    let pipeline = setup(home.path(), config(json!([]), json!([])))?;
    let src = source(home.path(), PRICES_INTO_2021)?;

    for key in ["2021-03", "2020-12", "2021-01"] {
        pipeline.ingest_and_transform(&src, key)?;
    }
    assert_eq!(pipeline.list_staging_keys()?, vec!["2020-12", "2021-01", "2021-03"]);

    pipeline.evaluate_and_route("2021-01")?;
    assert_eq!(pipeline.list_staging_keys()?, vec!["2020-12", "2021-03"]);
    Ok(())
}

#[test]
fn concurrent_run_on_same_key_is_rejected_without_logging() -> Result<()> {
    let home = tempfile::tempdir()?;
    let pipeline = setup(home.path(), config(json!([]), json!([])))?;
    let identity = pipeline.identity().clone();
    let src = source(home.path(), PRICES_INTO_2021)?;

    let held = RunLock::acquire(&identity, "busy")?;
    let err = pipeline.ingest_and_transform(&src, "busy").unwrap_err();
    assert!(matches!(err, PipelineError::RunLocked { .. }));
    assert!(!identity.log_path("busy", LogStage::Transformation, LogOutcome::Success).exists());
    assert!(!identity.log_path("busy", LogStage::Transformation, LogOutcome::Failure).exists());
    assert!(!identity.dataset_path(DatasetStage::Input, "busy").exists());

    drop(held);
    pipeline.ingest_and_transform(&src, "busy")?;
    Ok(())
}

#[test]
fn path_like_keys_are_rejected() -> Result<()> {
    let home = tempfile::tempdir()?;
    let pipeline = setup(home.path(), config(json!([]), json!([])))?;
    let src = source(home.path(), PRICES_INTO_2021)?;

    assert!(matches!(
        pipeline.ingest_and_transform(&src, "../escape"),
        Err(PipelineError::InvalidLoadControlKey { .. })
    ));
    Ok(())
}

#[test]
fn missing_pipeline_is_reported() {
    let home = tempfile::tempdir().expect("tempdir");
    let identity = PipelineIdentity::new(home.path(), "absent", 1);
    assert!(matches!(
        Pipeline::load(identity),
        Err(PipelineError::PipelineNotFound { .. })
    ));
}

#[test]
fn rerouted_key_resides_in_a_single_terminal_stage() -> Result<()> {
    let home = tempfile::tempdir()?;
    let pipeline = setup(home.path(), config(json!([]), json!([["null_data_check", null]])))?;
    let identity = pipeline.identity().clone();
    let output = identity.dataset_path(DatasetStage::Output, "k");
    let failed = identity.dataset_path(DatasetStage::Failed, "k");

    pipeline.ingest_and_transform(&source(home.path(), PRICES_INTO_2021)?, "k")?;
    pipeline.evaluate_and_route("k")?;
    assert!(output.exists());

    pipeline.ingest_and_transform(&source(home.path(), PRICES_WITH_NULL_ROW)?, "k")?;
    assert!(pipeline.evaluate_and_route("k").is_err());
    assert!(failed.exists());
    assert!(!output.exists());

    pipeline.ingest_and_transform(&source(home.path(), PRICES_INTO_2021)?, "k")?;
    pipeline.evaluate_and_route("k")?;
    assert!(output.exists());
    assert!(!failed.exists());
    assert_eq!(read_dataset(&output)?.height(), 2);
    Ok(())
}

#[test]
fn unsupported_source_is_rejected_before_it_is_read() -> Result<()> {
    let home = tempfile::tempdir()?;
    let pipeline = setup(home.path(), config(json!([]), json!([])))?;
    let identity = pipeline.identity().clone();

    let err = pipeline
        .ingest_and_transform(&home.path().join("prices.xlsx"), "xl")
        .unwrap_err();
    assert!(matches!(err.root_cause(), PipelineError::UnsupportedFormat { .. }));
    assert!(!identity.dataset_path(DatasetStage::Input, "xl").exists());
    assert_single_log(&identity, "xl", LogStage::Transformation, LogOutcome::Failure);
    Ok(())
}
