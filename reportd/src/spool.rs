//! Reads queued reports from a spool file of concatenated JSON objects,
//! usually one per line.

use reporting::NewReport;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum SpoolError {
    #[error("could not open spool file: {0}")]
    Open(#[from] std::io::Error),
    #[error("invalid report in spool file: {0}")]
    Parse(#[from] serde_json::Error),
}

pub fn read_reports(path: &Path) -> Result<Vec<NewReport>, SpoolError> {
    let reader = BufReader::new(File::open(path)?);
    let reports = serde_json::Deserializer::from_reader(reader)
        .into_iter::<NewReport>()
        .collect::<Result<Vec<_>, _>>()?;

    Ok(reports)
}
