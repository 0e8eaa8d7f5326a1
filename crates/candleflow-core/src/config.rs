use std::fmt;
use std::fs;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::layout::PipelineIdentity;
use crate::schema::ColumnSchema;

/// The persisted pipeline definition. Step names are not checked here; they are
/// resolved against the registries only when a stage runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub input_schema: ColumnSchema,
    pub output_schema: ColumnSchema,
    pub transformations: Vec<StepSpec>,
    pub evaluations: Vec<StepSpec>,
    #[serde(default)]
    pub visualizations: Vec<StepSpec>,
}

/// One `[name, args-or-null]` entry of a step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec(pub String, pub Option<Map<String, Value>>);

impl StepSpec {
    pub fn new(name: impl Into<String>) -> Self {
        StepSpec(name.into(), None)
    }

    pub fn with_args(name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => Some(map),
            _ => None,
        };
        StepSpec(name.into(), args)
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn args(&self) -> StepArgs {
        StepArgs(self.1.clone().unwrap_or_default())
    }
}

/// Keyword arguments handed to a step. Each step decodes them into its own
/// argument struct when invoked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepArgs(Map<String, Value>);

impl StepArgs {
    pub fn new(map: Map<String, Value>) -> Self {
        StepArgs(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parse<T: DeserializeOwned>(&self, step: &str) -> Result<T> {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(|source| {
            PipelineError::InvalidStepArguments {
                step: step.to_string(),
                source,
            }
        })
    }
}

impl fmt::Display for StepArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("{}");
        }
        match serde_json::to_string(&self.0) {
            Ok(rendered) => f.write_str(&rendered),
            Err(_) => f.write_str("<unprintable>"),
        }
    }
}

/// Reads `{name}_v{version}_config.json` for the given pipeline version.
pub fn load_config(identity: &PipelineIdentity) -> Result<PipelineConfig> {
    let path = identity.config_path();
    if !path.is_file() {
        return Err(PipelineError::PipelineNotFound {
            name: identity.name().to_string(),
            version: identity.version().to_string(),
            home: identity.home().to_path_buf(),
        });
    }
    let raw = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}
