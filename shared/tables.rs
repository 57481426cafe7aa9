//! Helpers for writing the tabular outputs of each workflow stage.

use polars::prelude::*;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("IO error while writing '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("CSV serialization error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TableError + '_ {
    move |source| TableError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Creates the parent directory of `path` when it has one.
pub fn ensure_parent_dir(path: &Path) -> Result<(), TableError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(io_error(parent))
        }
        _ => Ok(()),
    }
}

/// Appends `rows` to the CSV table at `path`.
///
/// The file and its parent directories are created when absent. The header is
/// written only when the file did not exist before this call.
pub fn append_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), TableError> {
    ensure_parent_dir(path)?;
    let existed = path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error(path))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!existed)
        .from_writer(file);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush().map_err(io_error(path))?;
    Ok(())
}

/// Overwrites `path` with `rows`, header included.
pub fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), TableError> {
    ensure_parent_dir(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush().map_err(io_error(path))?;
    Ok(())
}

/// Writes a DataFrame as comma-separated text with a header row.
pub fn write_frame(path: &Path, df: &mut DataFrame) -> Result<(), TableError> {
    ensure_parent_dir(path)?;
    let mut file = File::create(path).map_err(io_error(path))?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    Ok(())
}

/// Reads a comma-separated table keeping every cell as text.
pub fn read_text_frame(path: &Path) -> Result<DataFrame, TableError> {
    let file = File::open(path).map_err(io_error(path))?;
    let df = CsvReader::new(file)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(Some(0)),
        )
        .finish()?;
    Ok(df)
}

/// Reads a comma-separated table with inferred column types.
pub fn read_frame(path: &Path) -> Result<DataFrame, TableError> {
    let file = File::open(path).map_err(io_error(path))?;
    let df = CsvReader::new(file)
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()?;
    Ok(df)
}
