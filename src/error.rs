// src/error.rs

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Everything that can stop a PDF from being filed.
///
/// All variants are fatal for the batch: the driver halts on the first one and the
/// operator re-runs after fixing the cause.
#[derive(Error, Debug)]
pub enum FilingError {
    #[error("order identifier {0:?} has no '-' separating the company PO from the location")]
    MalformedOrderIdentifier(String),

    #[error("style {0:?} cannot be used to build a destination path")]
    MalformedStyle(String),

    #[error("invalid category or location: {0}")]
    InvalidCategoryOrLocation(String),

    #[error(
        "location PDF {company_po}-{location} (style {style}) arrived before its MASTER.\n\
         Either the MASTER PDF has not been processed yet (queue it and run again), or the \
         MASTER was filed under a different style number (fix the filed MASTER first).\n\
         In both cases delete this PO's row from the tracking sheet if one was written."
    )]
    MasterNotYetProcessed {
        style: String,
        company_po: String,
        location: String,
    },

    #[error("destination {0} already exists; another MASTER created it first")]
    DestinationAlreadyExists(PathBuf),

    #[error(
        "destination {0} exists but has neither a PO workbook nor a state marker. A MASTER \
         run stopped before finishing; remove the directory and re-run the MASTER PDF"
    )]
    StaleReservation(PathBuf),

    #[error(
        "PO workbook {0} not found. It may have been deleted or the MASTER PDF was never \
         finalized"
    )]
    DestinationArtifactMissing(PathBuf),

    #[error("extraction output was inconsistent across {attempts} attempts")]
    ExtractionInconsistent { attempts: u32 },

    #[error("extraction output is not a flat JSON object: {0}")]
    InvalidExtraction(String),

    #[error("extraction call failed: {0}")]
    Extraction(String),

    #[error("unreadable PDF: {0}")]
    UnreadablePdf(String),

    #[error("spreadsheet write failed: {0}")]
    SinkWriteFailure(String),

    #[error("workbook error: {0}")]
    Workbook(String),

    #[error("{file} was already filed into {destination}")]
    AlreadyFiled { file: String, destination: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("filing ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),
}

/// Lifecycle of one queued PDF. A failure is reported against the last stage reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Stage {
    #[default]
    Pending,
    Extracted,
    Normalized,
    Classified,
    Gated,
    Written,
    Archived,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Pending => "pending",
            Stage::Extracted => "extracted",
            Stage::Normalized => "normalized",
            Stage::Classified => "classified",
            Stage::Gated => "gated",
            Stage::Written => "written",
            Stage::Archived => "archived",
        };
        f.write_str(name)
    }
}

/// A per-file failure that halted the batch.
#[derive(Error, Debug)]
#[error("{file} failed after stage '{stage}': {source}")]
pub struct BatchError {
    pub file: String,
    pub stage: Stage,
    /// Tracking-sheet row appended for this file before it failed, if any.
    pub tracking_row: Option<u32>,
    #[source]
    pub source: FilingError,
}

impl BatchError {
    /// What the operator has to undo before re-running with the same PDF.
    pub fn remediation(&self) -> String {
        match self.tracking_row {
            Some(row) => format!(
                "delete row {row} from the tracking sheet, fix the cause and re-run with the same PDF"
            ),
            None => "fix the cause and re-run with the same PDF".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FilingError>;
