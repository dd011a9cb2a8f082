// src/sink/tracking.rs

use crate::error::Result;
use crate::layout::SizeLabels;
use crate::record::CanonicalRecord;
use async_trait::async_trait;
use tracing::info;

/// The shared tracking sheet: one row per processed PDF, columns defined by row 1.
#[async_trait]
pub trait TrackingSheet: Send + Sync {
    async fn header(&self) -> Result<Vec<String>>;

    /// Write `row` below the last used row and return its 1-based index.
    async fn append_row(&self, row: &[String]) -> Result<u32>;
}

/// Reindex a record against the sheet header. Headers the record does not know are
/// left blank; record fields without a header are dropped.
pub fn tracking_row(header: &[String], record: &CanonicalRecord, labels: SizeLabels) -> Vec<String> {
    header
        .iter()
        .map(|column| record.column(column.trim(), labels).unwrap_or("").to_string())
        .collect()
}

pub async fn append_record(
    sheet: &dyn TrackingSheet,
    record: &CanonicalRecord,
    labels: SizeLabels,
) -> Result<u32> {
    let header = sheet.header().await?;
    let row = tracking_row(&header, record, labels);
    let index = sheet.append_row(&row).await?;
    info!(row = index, columns = header.len(), "Tracking row appended");
    Ok(index)
}
