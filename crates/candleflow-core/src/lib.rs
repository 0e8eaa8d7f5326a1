pub mod config;
pub mod data_io;
mod dates;
pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod lock;
pub mod registration;
pub mod registry;
pub mod run_log;
pub mod schema;
pub mod steps;

pub use config::{load_config, PipelineConfig, StepArgs, StepSpec};
pub use data_io::{read_dataset, write_dataset, DataFormat};
pub use error::{PipelineError, Result};
pub use layout::{DatasetStage, LogOutcome, LogStage, PipelineIdentity};
pub use lifecycle::Pipeline;
pub use registration::{delete_pipeline, register_pipeline, Registration};
pub use registry::{
    builtin_evaluations, builtin_transformations, EvaluationRegistry, StepKind,
    TransformationRegistry,
};
pub use run_log::RunLogger;
pub use schema::{enforce_schema, ColumnSchema};
