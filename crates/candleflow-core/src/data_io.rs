use std::fs::File;
use std::path::Path;

use polars::prelude::*;

use crate::error::{PipelineError, Result};

/// On-disk formats the adapter understands, keyed purely by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Parquet,
    Json,
}

impl DataFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "csv" => Ok(DataFormat::Csv),
            "parquet" => Ok(DataFormat::Parquet),
            "json" => Ok(DataFormat::Json),
            _ => Err(unsupported(path)),
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, DataFormat::Csv | DataFormat::Parquet)
    }
}

fn unsupported(path: &Path) -> PipelineError {
    let extension = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    PipelineError::UnsupportedFormat {
        extension,
        path: path.to_path_buf(),
    }
}

/// Reads a dataset, selecting the reader from the path's extension.
pub fn read_dataset(path: &Path) -> Result<DataFrame> {
    let format = DataFormat::from_path(path)?;
    let df = match format {
        DataFormat::Csv => CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.to_path_buf()))?
            .finish()?,
        DataFormat::Parquet => ParquetReader::new(File::open(path)?).finish()?,
        DataFormat::Json => JsonReader::new(File::open(path)?).finish()?,
    };
    Ok(df)
}

/// Writes a fully materialized dataset; no index column is ever emitted.
///
/// The extension is checked before the file is created, so an unsupported
/// path leaves the filesystem untouched.
pub fn write_dataset(data: &DataFrame, path: &Path) -> Result<()> {
    write_dataset_as(data, path, DataFormat::from_path(path)?)
}

/// Writes in an explicit format regardless of the path's extension.
pub fn write_dataset_as(data: &DataFrame, path: &Path, format: DataFormat) -> Result<()> {
    if !format.is_writable() {
        return Err(unsupported(path));
    }

    let mut df = data.clone();
    let mut file = File::create(path)?;
    if format == DataFormat::Parquet {
        ParquetWriter::new(&mut file).finish(&mut df)?;
    } else {
        CsvWriter::new(&mut file)
            .include_header(true)
            .finish(&mut df)?;
    }
    file.sync_all()?;
    Ok(())
}
