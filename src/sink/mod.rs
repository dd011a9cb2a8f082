// src/sink/mod.rs

pub mod template;
pub mod tracking;
pub mod workbook;

use crate::cellmap::{CellMap, CellRef};
use crate::classify::{Classification, Destination};
use crate::error::Result;
use crate::gate::GateDecision;
use crate::layout::Layout;
use crate::record::CanonicalRecord;
use regex::Regex;
use std::sync::LazyLock;
use template::TemplateSheet;
use tracing::info;
use workbook::PoWorkbook;

static PLAIN_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?(0|[1-9][0-9]*)(\.[0-9]+)?$").expect("valid number pattern"));

/// Quantities like `12` or `2.5` are written as numbers. Values with leading zeros,
/// exponents or any other text stay strings.
pub fn is_plain_number(value: &str) -> bool {
    PLAIN_NUMBER_RE.is_match(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Created,
    Patched,
}

/// Applies a record through a cell map to the PO workbook of its destination.
pub struct SinkWriter<'a> {
    template: &'a dyn TemplateSheet,
    layout: &'a Layout,
}

impl<'a> SinkWriter<'a> {
    pub fn new(template: &'a dyn TemplateSheet, layout: &'a Layout) -> Self {
        Self { template, layout }
    }

    /// Create the workbook (first write) or patch it, as the gate decided.
    ///
    /// A first write only commits the destination's lifecycle once the workbook is
    /// on disk; on any error the reservation is dropped and the destination released.
    pub async fn write(
        &self,
        classification: &Classification,
        cell_map: &CellMap,
        record: &CanonicalRecord,
        decision: GateDecision<'_>,
    ) -> Result<WriteMode> {
        let cells = cell_values(cell_map, record);
        let destination = &classification.destination;
        match decision {
            GateDecision::FirstWrite(reservation) => {
                let tab = self.layout.tabs.tab(classification.category);
                self.create(destination, tab, &cells).await?;
                reservation.commit()?;
                Ok(WriteMode::Created)
            }
            GateDecision::Patch => {
                patch(destination, &cells)?;
                Ok(WriteMode::Patched)
            }
        }
    }

    async fn create(&self, destination: &Destination, tab: &str, cells: &[(CellRef, String)]) -> Result<()> {
        let bytes = template::snapshot(self.template, tab, cells).await?;
        let workbook = PoWorkbook::from_export(&bytes, tab)?;
        let path = destination.workbook_path();
        workbook.save(&path)?;
        info!(path = %path.display(), tab = %tab, "PO workbook created");
        Ok(())
    }
}

fn patch(destination: &Destination, cells: &[(CellRef, String)]) -> Result<()> {
    let path = destination.workbook_path();
    let mut workbook = PoWorkbook::open(&path)?;
    workbook.set_cells(cells)?;
    workbook.save(&path)?;
    info!(path = %path.display(), tab = %workbook.sheet_name(), cells = cells.len(), "PO workbook patched");
    Ok(())
}

/// Pair every mapped cell with the record's value for that field.
pub fn cell_values(cell_map: &CellMap, record: &CanonicalRecord) -> Vec<(CellRef, String)> {
    cell_map
        .iter()
        .map(|(field, cell)| (cell.clone(), record.value(*field).to_string()))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::fakes::{FakeTemplate, FiledWorkbook, TOTALS_CELL};
    use super::*;
    use crate::classify::classify;
    use crate::cellmap::build_cell_map;
    use crate::gate::{MemoryLifecycleStore, ensure_ordered};
    use crate::record::{RawExtraction, normalize};
    use calamine::Data;
    use serde_json::json;
    use std::path::Path;

    fn record(value: serde_json::Value) -> CanonicalRecord {
        let serde_json::Value::Object(map) = value else {
            unreachable!()
        };
        normalize(RawExtraction::new(map)).unwrap()
    }

    const TABS: [&str; 5] = ["Regular", "Reg_00", "Petite", "Petite_00", "Plus"];

    async fn file(
        writer: &SinkWriter<'_>,
        store: &MemoryLifecycleStore,
        root: &Path,
        rec: &CanonicalRecord,
    ) -> Result<WriteMode> {
        let layout = Layout::default();
        let classification = classify(rec, &layout, root)?;
        let map = build_cell_map(classification.category, &classification.location, &layout)?;
        let decision = ensure_ordered(store, &classification.destination, &classification.location)?;
        writer.write(&classification, &map, rec, decision).await
    }

    #[test]
    fn test_plain_numbers() {
        for value in ["0", "12", "2.5", "-3"] {
            assert!(is_plain_number(value), "{value}");
        }
        for value in ["", "007", "1e5", "12 pcs", "PO555", "6/25/2025", "+4", "inf"] {
            assert!(!is_plain_number(value), "{value}");
        }
    }

    #[tokio::test]
    async fn test_master_creates_one_tab_workbook() {
        let tmp = tempfile::tempdir().unwrap();
        let template = FakeTemplate::with_tabs(&TABS);
        let layout = Layout::default();
        let writer = SinkWriter::new(&template, &layout);
        let store = MemoryLifecycleStore::default();

        let master = record(json!({
            "Order#": "PO555-MASTER",
            "Style#": "AB12-PT",
            "Size 0": "3",
            "Size 16": "2",
            "Total": "5"
        }));
        let dest = classify(&master, &layout, tmp.path()).unwrap().destination;
        std::fs::create_dir_all(&dest.dir).unwrap();

        let mode = file(&writer, &store, tmp.path(), &master).await.unwrap();
        assert_eq!(mode, WriteMode::Created);

        let path = tmp.path().join("AB12/PO/PO555_AB12-PT/PO_PO555-MASTER.xlsx");
        let book = FiledWorkbook::read(&path);
        assert_eq!(book.tabs, vec!["Petite".to_string()]);
        assert_eq!(book.value("C12"), Data::Float(3.0));
        assert_eq!(book.text("G6"), "PO555");
        assert_eq!(book.text("A11"), "AB12-PT");
        assert_eq!(book.text("M25"), "5");
        assert_eq!(book.text("A1"), "PURCHASE ORDER");
        assert_eq!(book.formula(TOTALS_CELL), "SUM(C12:L19)");

        // Size 16 has no column on the petite tab; the template is blank again.
        assert_eq!(template.cell("Petite", "C12"), "");
        assert_eq!(template.cell("Petite", "G6"), "");
    }

    #[tokio::test]
    async fn test_location_patches_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let template = FakeTemplate::with_tabs(&TABS);
        let layout = Layout::default();
        let writer = SinkWriter::new(&template, &layout);
        let store = MemoryLifecycleStore::default();

        let master = record(json!({"Order#": "PO9-MASTER", "Style#": "ZZ1-P", "Size 14": "10"}));
        let dest = classify(&master, &layout, tmp.path()).unwrap().destination;
        std::fs::create_dir_all(&dest.dir).unwrap();
        file(&writer, &store, tmp.path(), &master).await.unwrap();

        let az1 = record(json!({"Order#": "PO9-AZ1", "Style#": "ZZ1-P", "Size 14": "4", "Color": "Black"}));
        let mode = file(&writer, &store, tmp.path(), &az1).await.unwrap();
        assert_eq!(mode, WriteMode::Patched);

        let book = FiledWorkbook::read(&dest.workbook_path());
        assert_eq!(book.tabs, vec!["Plus".to_string()]);
        assert_eq!(book.value("C12"), Data::Float(10.0));
        assert_eq!(book.value("C16"), Data::Float(4.0));
        assert_eq!(book.formula(TOTALS_CELL), "SUM(C12:L19)");
        // Header cells are MASTER-only.
        assert_eq!(book.text("A12"), "");
        assert_eq!(template.writes(), 2);
    }

    #[tokio::test]
    async fn test_failed_export_releases_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let template = FakeTemplate::with_tabs(&TABS);
        template.fail_exports(true);
        let layout = Layout::default();
        let writer = SinkWriter::new(&template, &layout);
        let store = MemoryLifecycleStore::default();

        let master = record(json!({"Order#": "PO1-MASTER", "Style#": "AB12", "Size 0": "1"}));
        let err = file(&writer, &store, tmp.path(), &master).await.unwrap_err();
        assert!(matches!(err, crate::error::FilingError::SinkWriteFailure(_)));

        let dest = classify(&master, &layout, tmp.path()).unwrap().destination;
        assert!(!store.exists(&dest));
        assert_eq!(template.cell("Regular", "C12"), "");
    }

    #[tokio::test]
    async fn test_patch_without_workbook() {
        let tmp = tempfile::tempdir().unwrap();
        let template = FakeTemplate::with_tabs(&TABS);
        let layout = Layout::default();
        let writer = SinkWriter::new(&template, &layout);

        let site = record(json!({"Order#": "PO1-GA1", "Style#": "AB12"}));
        let classification = classify(&site, &layout, tmp.path()).unwrap();
        let map = build_cell_map(classification.category, &classification.location, &layout).unwrap();
        let err = writer
            .write(&classification, &map, &site, GateDecision::Patch)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::FilingError::DestinationArtifactMissing(_)));
    }
}
