// src/sink/template.rs

use crate::cellmap::CellRef;
use crate::error::Result;
use async_trait::async_trait;
use tracing::{info, warn};

/// The live template spreadsheet: one tab per category, reused for every MASTER.
#[async_trait]
pub trait TemplateSheet: Send + Sync {
    /// Batch-write `cells` into `tab`.
    async fn write_cells(&self, tab: &str, cells: &[(CellRef, String)]) -> Result<()>;

    /// Download the whole spreadsheet as an xlsx workbook.
    async fn export_xlsx(&self) -> Result<Vec<u8>>;
}

/// Write `cells` into the template tab, export the spreadsheet and blank the same
/// cells again.
///
/// The blanking step runs whatever happened before it, so values of one style can
/// never leak into the next style's export. The first error wins.
pub async fn snapshot(
    sheet: &dyn TemplateSheet,
    tab: &str,
    cells: &[(CellRef, String)],
) -> Result<Vec<u8>> {
    let exported = match sheet.write_cells(tab, cells).await {
        Ok(()) => sheet.export_xlsx().await,
        Err(e) => Err(e),
    };

    let blanks: Vec<(CellRef, String)> = cells
        .iter()
        .map(|(cell, _)| (cell.clone(), String::new()))
        .collect();
    let cleared = sheet.write_cells(tab, &blanks).await;

    match (exported, cleared) {
        (Ok(bytes), Ok(())) => {
            info!(tab = %tab, cells = cells.len(), bytes = bytes.len(), "Template exported and cleared");
            Ok(bytes)
        }
        (Ok(_), Err(e)) => {
            warn!(tab = %tab, error = %e, "Template export succeeded but clearing failed");
            Err(e)
        }
        (Err(e), cleared) => {
            if let Err(clear_err) = cleared {
                warn!(tab = %tab, error = %clear_err, "Template could not be cleared after a failed export");
            }
            Err(e)
        }
    }
}
