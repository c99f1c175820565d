//! Read/write dataset JSON files.
//!
//! The file holds a `DatasetArrays` object: `means` (`n × 6`), `covariances`
//! (`n × 6 × 6`) and an optional `background_ln_overlaps` column. Parsed arrays
//! go through the same validation as any other `Dataset`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::data::{Dataset, DatasetArrays};
use crate::error::FitError;

/// Read and validate a dataset JSON file.
pub fn read_dataset_json(path: &Path) -> Result<Dataset, FitError> {
    let file = File::open(path)?;
    let arrays: DatasetArrays = serde_json::from_reader(BufReader::new(file))?;
    let dataset = Dataset::try_from(arrays)?;
    info!(path = %path.display(), n_stars = dataset.len(), "dataset loaded");
    Ok(dataset)
}

pub fn write_dataset_json(path: &Path, dataset: &Dataset) -> Result<(), FitError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, &dataset.to_arrays())?;
    writer.flush()?;
    Ok(())
}
