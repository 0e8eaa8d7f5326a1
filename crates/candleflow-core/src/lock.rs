use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::layout::PipelineIdentity;

/// Exclusive advisory lock over one load control key of one pipeline version.
/// Held for the duration of a lifecycle operation and released on drop.
///
/// Lock files stay in `.locks/` after release, one per key ever run, and are
/// reused by later runs of the same key. The file must never be unlinked while
/// another process may hold it open. `delete_pipeline` removes them with the
/// pipeline version.
#[derive(Debug)]
pub struct RunLock {
    file: Option<File>,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(identity: &PipelineIdentity, load_control_key: &str) -> Result<Self> {
        let dir = identity.lock_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{load_control_key}.lock"));

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if is_contended(&err) => {
                return Err(PipelineError::RunLocked {
                    load_control_key: load_control_key.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        }

        debug!(lock = %path.display(), "acquired run lock");
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            FileExt::unlock(&file)?;
        }
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    let contended = fs2::lock_contended_error().raw_os_error();
    err.kind() == io::ErrorKind::WouldBlock
        || (err.raw_os_error().is_some() && err.raw_os_error() == contended)
}
