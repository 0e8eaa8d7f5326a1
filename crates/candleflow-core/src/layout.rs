use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

/// (home, name, version): the composite key of one registered pipeline version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineIdentity {
    home: PathBuf,
    name: String,
    version: String,
}

impl PipelineIdentity {
    pub fn new(
        home: impl Into<PathBuf>,
        name: impl Into<String>,
        version: impl fmt::Display,
    ) -> Self {
        Self {
            home: home.into(),
            name: name.into(),
            version: version.to_string(),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// `{home}/pipelines/{name}/version={version}`
    pub fn root(&self) -> PathBuf {
        self.home
            .join("pipelines")
            .join(&self.name)
            .join(format!("version={}", self.version))
    }

    fn file_prefix(&self) -> String {
        format!("{}_v{}", self.name, self.version)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root()
            .join(format!("{}_config.json", self.file_prefix()))
    }

    pub fn dataset_dir(&self, stage: DatasetStage) -> PathBuf {
        self.root()
            .join("datasets")
            .join(format!("{}_datasets", stage.as_str()))
    }

    pub fn dataset_file_prefix(&self, stage: DatasetStage) -> String {
        format!("{}_{}_data_", self.file_prefix(), stage.as_str())
    }

    /// `datasets/{stage}_datasets/{name}_v{version}_{stage}_data_{key}.csv`
    pub fn dataset_path(&self, stage: DatasetStage, load_control_key: &str) -> PathBuf {
        self.dataset_dir(stage).join(format!(
            "{}{}.{}",
            self.dataset_file_prefix(stage),
            load_control_key,
            DATASET_EXTENSION
        ))
    }

    pub fn log_dir(&self, stage: LogStage, outcome: LogOutcome) -> PathBuf {
        self.root()
            .join("logs")
            .join(format!("{}_logs", stage.as_str()))
            .join(outcome.dir_name())
    }

    /// Base name shared by both halves of a run log pair, without the
    /// `_OUTPUT.log` / `_ERROR.log` suffix.
    pub fn log_name(&self, load_control_key: &str, stage: LogStage) -> String {
        format!(
            "{}_{}_{}",
            self.file_prefix(),
            load_control_key,
            stage.as_str()
        )
    }

    pub fn log_path(&self, load_control_key: &str, stage: LogStage, outcome: LogOutcome) -> PathBuf {
        self.log_dir(stage, outcome).join(format!(
            "{}_{}.log",
            self.log_name(load_control_key, stage),
            outcome.suffix()
        ))
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root().join(".locks")
    }

    /// Every directory registration creates under the pipeline root.
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = DatasetStage::ALL
            .iter()
            .map(|stage| self.dataset_dir(*stage))
            .collect();
        for stage in LogStage::ALL {
            for outcome in LogOutcome::ALL {
                dirs.push(self.log_dir(stage, outcome));
            }
        }
        dirs
    }
}

impl fmt::Display for PipelineIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

pub const DATASET_EXTENSION: &str = "csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetStage {
    Input,
    Staging,
    Output,
    Failed,
}

impl DatasetStage {
    pub const ALL: [DatasetStage; 4] = [
        DatasetStage::Input,
        DatasetStage::Staging,
        DatasetStage::Output,
        DatasetStage::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetStage::Input => "input",
            DatasetStage::Staging => "staging",
            DatasetStage::Output => "output",
            DatasetStage::Failed => "failed",
        }
    }
}

impl fmt::Display for DatasetStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStage {
    Transformation,
    Evaluation,
}

impl LogStage {
    pub const ALL: [LogStage; 2] = [LogStage::Transformation, LogStage::Evaluation];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogStage::Transformation => "transformation",
            LogStage::Evaluation => "evaluation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogOutcome {
    Success,
    Failure,
}

impl LogOutcome {
    pub const ALL: [LogOutcome; 2] = [LogOutcome::Success, LogOutcome::Failure];

    fn dir_name(&self) -> &'static str {
        match self {
            LogOutcome::Success => "successful_run_logs",
            LogOutcome::Failure => "failed_run_logs",
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            LogOutcome::Success => "OUTPUT",
            LogOutcome::Failure => "ERROR",
        }
    }
}

/// Load control keys become part of file names, so they must stay inside one directory.
pub fn validate_load_control_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key == "."
        || key.contains("..")
        || key.contains('/')
        || key.contains('\\')
        || key.contains('\0');
    if invalid {
        return Err(PipelineError::InvalidLoadControlKey {
            key: key.to_string(),
        });
    }
    Ok(())
}
