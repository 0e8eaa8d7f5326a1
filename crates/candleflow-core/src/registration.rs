use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::layout::PipelineIdentity;

/// A registration request: pipeline identity plus its configuration.
/// Persisted as-is, so the stored record carries the identity fields too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    pub home_directory: PathBuf,
    #[serde(flatten)]
    pub config: PipelineConfig,
}

impl Registration {
    pub fn new(
        home_directory: impl Into<PathBuf>,
        name: impl Into<String>,
        version: impl ToString,
        config: PipelineConfig,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.to_string(),
            home_directory: home_directory.into(),
            config,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn identity(&self) -> PipelineIdentity {
        PipelineIdentity::new(&self.home_directory, &self.name, &self.version)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "version must be a string or number, got {other}"
        ))),
    }
}

/// Creates the directory tree of a pipeline version and writes its config.
pub fn register_pipeline(registration: &Registration, overwrite: bool) -> Result<PipelineIdentity> {
    let identity = registration.identity();
    if overwrite && delete_pipeline(&identity)? {
        warn!(pipeline = %identity, "overwrote existing pipeline version");
    }

    let root = identity.root();
    if root.exists() {
        return Err(PipelineError::PipelineExists {
            name: identity.name().to_string(),
            version: identity.version().to_string(),
            home: identity.home().to_path_buf(),
        });
    }

    for dir in identity.directories() {
        fs::create_dir_all(&dir)?;
    }

    let mut rendered = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut rendered, formatter);
    registration.serialize(&mut serializer)?;
    fs::write(identity.config_path(), rendered)?;

    info!(pipeline = %identity, root = %root.display(), "registered pipeline");
    Ok(identity)
}

/// Removes a pipeline version wholesale. Returns whether anything was deleted.
pub fn delete_pipeline(identity: &PipelineIdentity) -> Result<bool> {
    let root = identity.root();
    if !root.exists() {
        return Ok(false);
    }
    fs::remove_dir_all(&root)?;
    Ok(true)
}
