use std::path::Path;

use anyhow::{Context, Result};
use csv::Writer;

use crate::db::ListingRecord;

/// Write listings as CSV with a header row. Returns the number of rows.
pub fn write_csv(path: &Path, records: &[ListingRecord]) -> Result<usize> {
    let mut writer =
        Writer::from_path(path).with_context(|| format!("cannot create {}", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(records.len())
}
