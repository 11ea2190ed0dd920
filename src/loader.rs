use std::path::Path;

use tracing::{error, info};

use crate::error::{Error, Result};
use crate::models::RawRecord;

/// Reads the historical appointments CSV.
pub fn load(path: &Path) -> Result<Vec<RawRecord>> {
    if !path.exists() {
        error!(path = %path.display(), "dataset not found");
        return Err(Error::DataNotFound(path.to_path_buf()));
    }

    info!(path = %path.display(), "loading dataset");
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for (line, result) in reader.deserialize::<RawRecord>().enumerate() {
        let record = result
            .map_err(|e| Error::Dataset(format!("row {}: {e}", line + 1)))?;
        records.push(record);
    }

    info!(records = records.len(), "dataset loaded");
    Ok(records)
}
