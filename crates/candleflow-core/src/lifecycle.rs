use std::fs::{self, File};
use std::path::{Path, PathBuf};

use polars::prelude::DataFrame;
use tracing::{info, warn};

use crate::config::{load_config, PipelineConfig, StepSpec};
use crate::data_io::{read_dataset, write_dataset, write_dataset_as, DataFormat};
use crate::error::{PipelineError, Result};
use crate::layout::{validate_load_control_key, DatasetStage, LogStage, PipelineIdentity, DATASET_EXTENSION};
use crate::lock::RunLock;
use crate::registry::{
    builtin_evaluations, builtin_transformations, EvaluationRegistry, TransformationRegistry,
};
use crate::run_log::{run_step, RunLogger};
use crate::schema::{enforce_schema, ColumnSchema};

/// Drives one pipeline version through `input -> staging -> output | failed`.
///
/// Holds no dataset of its own: each stage reads what it needs from disk and
/// threads the frame through its steps by value.
#[derive(Debug, Clone)]
pub struct Pipeline {
    identity: PipelineIdentity,
    config: PipelineConfig,
    transformations: TransformationRegistry,
    evaluations: EvaluationRegistry,
    echo: bool,
}

impl Pipeline {
    /// Loads the persisted configuration and binds the built-in step registries.
    pub fn load(identity: PipelineIdentity) -> Result<Self> {
        let config = load_config(&identity)?;
        Ok(Self::with_registries(
            identity,
            config,
            builtin_transformations().clone(),
            builtin_evaluations().clone(),
        ))
    }

    pub fn with_registries(
        identity: PipelineIdentity,
        config: PipelineConfig,
        transformations: TransformationRegistry,
        evaluations: EvaluationRegistry,
    ) -> Self {
        Self {
            identity,
            config,
            transformations,
            evaluations,
            echo: true,
        }
    }

    /// Controls whether run logs are echoed to stdout after each stage.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn identity(&self) -> &PipelineIdentity {
        &self.identity
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Reads `source_path`, keeps a raw copy in `input`, and writes the
    /// transformed dataset to `staging`. Returns the staging artifact path.
    pub fn ingest_and_transform(&self, source_path: &Path, load_control_key: &str) -> Result<PathBuf> {
        validate_load_control_key(load_control_key)?;
        let _lock = RunLock::acquire(&self.identity, load_control_key)?;
        let arguments = format!(
            "source_path={}, load_control_key={load_control_key}",
            source_path.display()
        );
        self.logger(load_control_key, LogStage::Transformation)
            .run("ingest_and_transform", arguments, || {
                self.transform_stage(source_path, load_control_key)
            })
    }

    /// Evaluates the staged dataset and moves it to `output` when no check
    /// fails, or to `failed` otherwise. The move happens before
    /// `EvaluationFailed` is returned.
    pub fn evaluate_and_route(&self, load_control_key: &str) -> Result<PathBuf> {
        validate_load_control_key(load_control_key)?;
        let _lock = RunLock::acquire(&self.identity, load_control_key)?;
        self.logger(load_control_key, LogStage::Evaluation).run(
            "evaluate_and_route",
            format!("load_control_key={load_control_key}"),
            || self.evaluation_stage(load_control_key),
        )
    }

    /// Load control keys with an artifact currently in `staging`, sorted.
    pub fn list_staging_keys(&self) -> Result<Vec<String>> {
        let dir = self.identity.dataset_dir(DatasetStage::Staging);
        let prefix = self.identity.dataset_file_prefix(DatasetStage::Staging);
        let suffix = format!(".{DATASET_EXTENSION}");
        let pattern = format!(
            "{}*{suffix}",
            glob::Pattern::escape(&dir.join(&prefix).to_string_lossy())
        );

        let mut keys = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|err| err.into_error())?;
            let key = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(prefix.as_str()))
                .and_then(|name| name.strip_suffix(suffix.as_str()));
            if let Some(key) = key.filter(|key| !key.is_empty()) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn logger(&self, load_control_key: &str, stage: LogStage) -> RunLogger {
        RunLogger::for_stage(&self.identity, load_control_key, stage).with_echo(self.echo)
    }

    fn transform_stage(&self, source_path: &Path, load_control_key: &str) -> Result<PathBuf> {
        let staging_path = self.identity.dataset_path(DatasetStage::Staging, load_control_key);
        if staging_path.exists() {
            warn!(path = %staging_path.display(), "discarding previous staging artifact");
            fs::remove_file(&staging_path)?;
        }

        DataFormat::from_path(source_path)?;
        let digest = blake3::Hasher::new()
            .update_reader(File::open(source_path)?)?
            .finalize();
        info!(
            pipeline = %self.identity,
            load_control_key,
            source = %source_path.display(),
            blake3 = %digest.to_hex(),
            "ingesting source dataset"
        );

        let data = run_step("read_data", source_path.display(), || read_dataset(source_path))?;
        let input_path = self.identity.dataset_path(DatasetStage::Input, load_control_key);
        run_step("write_input_data", input_path.display(), || {
            write_dataset(&data, &input_path)
        })?;

        let data = self.enforce("enforce_input_schema", data, &self.config.input_schema)?;
        let data = self.apply_transformations(data)?;
        let data = self.enforce("enforce_output_schema", data, &self.config.output_schema)?;

        let partial = staging_path.with_extension(format!("{DATASET_EXTENSION}.tmp"));
        run_step("write_staging_data", staging_path.display(), || {
            write_dataset_as(&data, &partial, DataFormat::Csv)?;
            move_artifact(&partial, &staging_path)
        })?;
        info!(rows = data.height(), path = %staging_path.display(), "staged dataset");
        Ok(staging_path)
    }

    fn apply_transformations(&self, data: DataFrame) -> Result<DataFrame> {
        let mut data = data;
        for spec in &self.config.transformations {
            let transform = self.transformations.resolve(spec.name())?;
            let args = spec.args();
            data = run_step(spec.name(), &args, || transform(data, &args))?;
        }
        Ok(data)
    }

    fn evaluation_stage(&self, load_control_key: &str) -> Result<PathBuf> {
        let staging_path = self.identity.dataset_path(DatasetStage::Staging, load_control_key);
        if !staging_path.is_file() {
            return Err(PipelineError::StagedDatasetMissing {
                load_control_key: load_control_key.to_string(),
                path: staging_path,
            });
        }

        let data = run_step("read_data", staging_path.display(), || read_dataset(&staging_path))?;
        let data = self.enforce("enforce_output_schema", data, &self.config.output_schema)?;
        let failed = self.run_evaluations(&data, &self.config.evaluations)?;

        if failed.is_empty() {
            let output_path = self.identity.dataset_path(DatasetStage::Output, load_control_key);
            self.discard_terminal(DatasetStage::Failed, load_control_key)?;
            move_artifact(&staging_path, &output_path)?;
            info!(path = %output_path.display(), "promoted dataset to output");
            return Ok(output_path);
        }

        let failed_path = self.identity.dataset_path(DatasetStage::Failed, load_control_key);
        self.discard_terminal(DatasetStage::Output, load_control_key)?;
        move_artifact(&staging_path, &failed_path)?;
        warn!(
            path = %failed_path.display(),
            failed = %failed.join(", "),
            "demoted dataset to failed"
        );
        Err(PipelineError::EvaluationFailed {
            load_control_key: load_control_key.to_string(),
            failed,
        })
    }

    // A key resides in at most one terminal stage, so an earlier routing of
    // the same key to the other stage is dropped.
    fn discard_terminal(&self, stage: DatasetStage, load_control_key: &str) -> Result<()> {
        let stale = self.identity.dataset_path(stage, load_control_key);
        if stale.exists() {
            warn!(path = %stale.display(), "discarding artifact from an earlier routing");
            fs::remove_file(&stale)?;
        }
        Ok(())
    }

    // Every evaluation sees the same frame; results do not chain.
    fn run_evaluations(&self, data: &DataFrame, evaluations: &[StepSpec]) -> Result<Vec<String>> {
        let mut failed = Vec::new();
        for spec in evaluations {
            let check = self.evaluations.resolve(spec.name())?;
            let args = spec.args();
            let flagged = run_step(spec.name(), &args, || check(data, &args))?;
            info!(evaluation = spec.name(), failed = flagged, "evaluation finished");
            if flagged {
                failed.push(spec.name().to_string());
            }
        }
        Ok(failed)
    }

    fn enforce(&self, step: &str, data: DataFrame, schema: &ColumnSchema) -> Result<DataFrame> {
        run_step(step, format!("{schema:?}"), || enforce_schema(data, schema))
    }
}

fn move_artifact(from: &Path, to: &Path) -> Result<()> {
    let promotion_error = |source| PipelineError::Promotion {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(promotion_error)?;
    }
    fs::rename(from, to).map_err(promotion_error)
}
