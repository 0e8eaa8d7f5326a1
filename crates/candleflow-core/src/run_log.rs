use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use tracing::{info, warn};

use crate::error::{error_chain, PipelineError, Result};
use crate::layout::{LogOutcome, LogStage, PipelineIdentity};

const SEPARATOR: &str =
    "-------------------------------------------------------------------------------------------";

/// Runs a stage with its diagnostics captured in a success/failure log pair.
///
/// Every `tracing` event emitted on the calling thread while the stage runs is
/// written to the success log. If the stage fails (or panics) the success log
/// is renamed over the failure log, so exactly one of the two files remains.
#[derive(Debug, Clone)]
pub struct RunLogger {
    success_path: PathBuf,
    failure_path: PathBuf,
    echo: bool,
}

impl RunLogger {
    pub fn new(success_path: impl Into<PathBuf>, failure_path: impl Into<PathBuf>) -> Self {
        Self {
            success_path: success_path.into(),
            failure_path: failure_path.into(),
            echo: true,
        }
    }

    pub fn for_stage(identity: &PipelineIdentity, load_control_key: &str, stage: LogStage) -> Self {
        Self::new(
            identity.log_path(load_control_key, stage, LogOutcome::Success),
            identity.log_path(load_control_key, stage, LogOutcome::Failure),
        )
    }

    /// Controls whether the finished log is copied to stdout.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn success_path(&self) -> &Path {
        &self.success_path
    }

    pub fn failure_path(&self) -> &Path {
        &self.failure_path
    }

    pub fn run<T, F>(&self, stage: &str, args: impl fmt::Display, body: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        for path in [&self.success_path, &self.failure_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = Arc::new(File::create(&self.success_path)?);
        let started = Instant::now();
        write_block(
            &file,
            &[
                Local::now().to_string(),
                format!("Running function: {stage}"),
                format!("args: {args}"),
            ],
        )?;

        let mut guard = PanicGuard {
            logger: self,
            file: Some(Arc::clone(&file)),
            stage,
            started,
        };

        let subscriber = tracing_subscriber::fmt()
            .with_writer(Arc::clone(&file))
            .with_ansi(false)
            .with_target(false)
            .finish();
        let outcome = tracing::subscriber::with_default(subscriber, body);
        guard.file = None;

        match outcome {
            Ok(value) => {
                write_footer(&file, stage, true, started)?;
                file.sync_all()?;
                drop(file);
                // The stage already took effect; cleanup problems only get logged.
                if let Err(err) = remove_if_present(&self.failure_path) {
                    warn!(
                        path = %self.failure_path.display(),
                        error = %err,
                        "could not remove stale failure log"
                    );
                }
                self.echo_log(&self.success_path);
                Ok(value)
            }
            Err(err) => {
                let detail = error_chain(&err);
                write_failure(&file, stage, &detail)?;
                write_footer(&file, stage, false, started)?;
                file.sync_all()?;
                drop(file);
                self.demote()?;
                self.echo_log(&self.failure_path);
                Err(PipelineError::StageLoggedFailure {
                    stage: stage.to_string(),
                    detail,
                    source: Box::new(err),
                })
            }
        }
    }

    fn demote(&self) -> io::Result<()> {
        remove_if_present(&self.failure_path)?;
        fs::rename(&self.success_path, &self.failure_path)
    }

    fn echo_log(&self, path: &Path) {
        if !self.echo {
            return;
        }
        let echoed = fs::read_to_string(path).and_then(|content| {
            let mut stdout = io::stdout().lock();
            stdout.write_all(content.as_bytes())?;
            stdout.flush()
        });
        if let Err(err) = echoed {
            warn!(path = %path.display(), error = %err, "could not echo run log");
        }
    }
}

/// Narrates one sub-step of a logged stage.
pub fn run_step<T>(name: &str, args: impl fmt::Display, body: impl FnOnce() -> Result<T>) -> Result<T> {
    info!("Running step: {name}");
    info!("args: {args}");
    let value = body()?;
    info!("{name}: COMPLETE");
    Ok(value)
}

// Finalises the log pair when the stage closure unwinds.
struct PanicGuard<'a> {
    logger: &'a RunLogger,
    file: Option<Arc<File>>,
    stage: &'a str,
    started: Instant,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = write_failure(&file, self.stage, "the stage panicked");
            let _ = write_footer(&file, self.stage, false, self.started);
            drop(file);
            let _ = self.logger.demote();
        }
    }
}

fn write_block(file: &File, lines: &[String]) -> io::Result<()> {
    let mut handle = file;
    writeln!(handle, "\n\n{SEPARATOR}")?;
    for line in lines {
        writeln!(handle, "{line}")?;
    }
    writeln!(handle, "{SEPARATOR}")
}

fn write_failure(file: &File, stage: &str, detail: &str) -> io::Result<()> {
    let mut handle = file;
    writeln!(handle, "\n\n{stage} failed with the following error:\n\n{detail}")
}

fn write_footer(file: &File, stage: &str, succeeded: bool, started: Instant) -> io::Result<()> {
    let status = if succeeded {
        format!("{stage} Completed Successfully")
    } else {
        format!("{stage} Failed")
    };
    write_block(
        file,
        &[
            Local::now().to_string(),
            status,
            format!("Total Runtime: {:.2}s", started.elapsed().as_secs_f64()),
        ],
    )
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
