// src/batch.rs

use crate::cellmap::build_cell_map;
use crate::classify::classify;
use crate::error::{BatchError, FilingError, Result, Stage};
use crate::filing_db::{FilingLedger, NewFiling};
use crate::gate::{FilingState, LifecycleStore, ensure_ordered};
use crate::layout::Layout;
use crate::llm_extract::{self, ConsistencyPolicy, ExtractionOracle};
use crate::record::normalize;
use crate::sink::template::TemplateSheet;
use crate::sink::tracking::{TrackingSheet, append_record};
use crate::sink::{SinkWriter, WriteMode, cell_values};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Everything one run needs. All collaborators are borrowed so tests can keep
/// handles on the fakes.
pub struct BatchDriver<'a> {
    pub oracle: &'a dyn ExtractionOracle,
    pub tracking: &'a dyn TrackingSheet,
    pub template: &'a dyn TemplateSheet,
    pub lifecycle: &'a dyn LifecycleStore,
    pub ledger: &'a FilingLedger,
    pub layout: &'a Layout,
    pub policy: ConsistencyPolicy,
    pub intake_dir: &'a Path,
    pub filing_root: &'a Path,
}

/// Outcome of one successfully filed PDF.
#[derive(Debug, Clone)]
pub struct FiledPdf {
    pub file: String,
    pub location: String,
    pub destination: PathBuf,
    pub mode: WriteMode,
    pub tracking_row: u32,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub filed: Vec<FiledPdf>,
}

impl BatchSummary {
    pub fn per_location(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for filed in &self.filed {
            *counts.entry(filed.location.as_str()).or_insert(0) += 1;
        }
        counts
    }

    pub fn workbooks_created(&self) -> usize {
        self.filed.iter().filter(|f| f.mode == WriteMode::Created).count()
    }
}

/// Dry-run view of one PDF: what would be written where.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub file: String,
    pub already_filed_into: Option<String>,
    pub category: String,
    pub location: String,
    pub destination: PathBuf,
    pub gate: &'static str,
    pub record: Vec<(String, String)>,
    pub cells: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Progress {
    stage: Stage,
    tracking_row: Option<u32>,
}

/// `*.pdf` files in `dir`, oldest first; ties broken by file name.
pub fn list_intake(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut queued: Vec<(SystemTime, String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if !is_pdf || !entry.file_type()?.is_file() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        queued.push((modified, name, path));
    }
    queued.sort();
    Ok(queued.into_iter().map(|(_, _, path)| path).collect())
}

/// Move the PDF into the destination directory, replacing a same-named file.
pub fn archive(pdf: &Path, destination_dir: &Path) -> Result<PathBuf> {
    let name = pdf
        .file_name()
        .ok_or_else(|| FilingError::Config(format!("{} has no file name", pdf.display())))?;
    let target = destination_dir.join(name);
    if fs::rename(pdf, &target).is_err() {
        // Crossing filesystems: copy, then drop the original.
        fs::copy(pdf, &target)?;
        fs::remove_file(pdf)?;
    }
    info!(to = %target.display(), "PDF archived");
    Ok(target)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl BatchDriver<'_> {
    /// Process the intake queue in order, halting on the first failure.
    pub async fn run(&self) -> std::result::Result<BatchSummary, BatchError> {
        let queue = list_intake(self.intake_dir).map_err(|source| BatchError {
            file: self.intake_dir.display().to_string(),
            stage: Stage::Pending,
            tracking_row: None,
            source,
        })?;
        info!(queued = queue.len(), intake = %self.intake_dir.display(), "Batch started");

        let mut summary = BatchSummary::default();
        for (index, path) in queue.iter().enumerate() {
            let span = info_span!("pdf", filename = %display_name(path));
            match self.process_file(path).instrument(span).await {
                Ok(filed) => summary.filed.push(filed),
                Err(e) => {
                    error!(
                        file = %e.file,
                        stage = %e.stage,
                        tracking_row = ?e.tracking_row,
                        error = %e.source,
                        "Batch halted"
                    );
                    warn!(
                        filed = summary.filed.len(),
                        not_processed = queue.len() - index - 1,
                        next = %e.remediation(),
                        "Remaining PDFs left in the intake folder"
                    );
                    return Err(e);
                }
            }
        }

        info!(
            filed = summary.filed.len(),
            workbooks_created = summary.workbooks_created(),
            per_location = ?summary.per_location(),
            "Batch complete"
        );
        Ok(summary)
    }

    /// Carry one PDF through every stage. The error names the last stage reached.
    pub async fn process_file(&self, path: &Path) -> std::result::Result<FiledPdf, BatchError> {
        let mut progress = Progress::default();
        let outcome = self.file_pdf(path, &mut progress).await;
        outcome.map_err(|source| BatchError {
            file: display_name(path),
            stage: progress.stage,
            tracking_row: progress.tracking_row,
            source,
        })
    }

    async fn file_pdf(&self, path: &Path, progress: &mut Progress) -> Result<FiledPdf> {
        let file = display_name(path);
        let bytes = fs::read(path)?;
        let hash = FilingLedger::document_hash(&bytes);
        if let Some(previous) = self.ledger.find_filing(&hash)? {
            return Err(FilingError::AlreadyFiled {
                file,
                destination: previous.destination,
            });
        }

        let raw = llm_extract::extract(self.oracle, &file, &bytes, self.policy).await?;
        progress.stage = Stage::Extracted;

        let record = normalize(raw)?;
        progress.stage = Stage::Normalized;
        info!(
            company_po = %record.company_po,
            location = %record.location,
            style = %record.style,
            "Record normalized"
        );

        let classification = classify(&record, self.layout, self.filing_root)?;
        let cell_map = build_cell_map(classification.category, &classification.location, self.layout)?;
        progress.stage = Stage::Classified;
        debug!(
            cells = cell_map.len(),
            sizes = cell_map.sizes().count(),
            destination = %classification.destination.dir.display(),
            "Record classified"
        );

        let decision = ensure_ordered(
            self.lifecycle,
            &classification.destination,
            &classification.location,
        )?;
        progress.stage = Stage::Gated;

        let row = append_record(self.tracking, &record, self.layout.size_labels).await?;
        progress.tracking_row = Some(row);

        let mode = SinkWriter::new(self.template, self.layout)
            .write(&classification, &cell_map, &record, decision)
            .await?;
        progress.stage = Stage::Written;

        let destination = classification.destination.dir.clone();
        archive(path, &destination)?;
        progress.stage = Stage::Archived;

        self.ledger.record_filing(&NewFiling {
            pdf_sha256: &hash,
            filename: &file,
            style: &classification.destination.full_style,
            company_po: &classification.destination.company_po,
            location: classification.location.as_str(),
            category: &classification.category.to_string(),
            destination: &destination.display().to_string(),
            tracking_row: Some(row),
        })?;

        info!(
            category = %classification.category,
            location = %classification.location,
            mode = ?mode,
            "PDF filed"
        );
        Ok(FiledPdf {
            file,
            location: classification.location.to_string(),
            destination,
            mode,
            tracking_row: row,
        })
    }

    /// Extract and classify one PDF without writing anything.
    pub async fn check_file(&self, path: &Path) -> Result<CheckReport> {
        let file = display_name(path);
        let bytes = fs::read(path)?;
        let already_filed_into = self
            .ledger
            .find_filing(&FilingLedger::document_hash(&bytes))?
            .map(|f| f.destination);

        let raw = llm_extract::extract(self.oracle, &file, &bytes, self.policy).await?;
        let record = normalize(raw)?;
        let classification = classify(&record, self.layout, self.filing_root)?;
        let cell_map = build_cell_map(classification.category, &classification.location, self.layout)?;

        let gate = match (
            self.lifecycle.state(&classification.destination)?,
            classification.location.is_master(),
        ) {
            (FilingState::MasterWritten, _) => "patch",
            (FilingState::NotStarted, true) => "create",
            (FilingState::NotStarted, false) => "blocked: MASTER not filed yet",
        };

        Ok(CheckReport {
            file,
            already_filed_into,
            category: classification.category.to_string(),
            location: classification.location.to_string(),
            destination: classification.destination.dir.clone(),
            gate,
            record: record.columns(self.layout.size_labels),
            cells: cell_values(&cell_map, &record)
                .into_iter()
                .map(|(cell, value)| (cell.to_string(), value))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::FsLifecycleStore;
    use crate::llm_extract::fakes::ScriptedOracle;
    use crate::sink::fakes::{FakeTemplate, FakeTracking, FiledWorkbook, TOTALS_CELL};
    use calamine::Data;
    use serde_json::json;
    use tempfile::TempDir;

    const TABS: [&str; 5] = ["Regular", "Reg_00", "Petite", "Petite_00", "Plus"];
    const HEADER: [&str; 6] = ["STYLE#", "Company PO#", "Location", "0", "2", "Total"];

    struct Fixture {
        _tmp: TempDir,
        intake: PathBuf,
        root: PathBuf,
        oracle: ScriptedOracle,
        tracking: FakeTracking,
        template: FakeTemplate,
        lifecycle: FsLifecycleStore,
        ledger: FilingLedger,
        layout: Layout,
    }

    impl Fixture {
        fn new(outputs: &[serde_json::Value]) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let intake = tmp.path().join("queue");
            let root = tmp.path().join("filed");
            fs::create_dir_all(&intake).unwrap();
            fs::create_dir_all(&root).unwrap();
            Self {
                intake,
                root,
                oracle: ScriptedOracle::new(outputs.iter().map(|o| o.to_string())),
                tracking: FakeTracking::with_header(&HEADER),
                template: FakeTemplate::with_tabs(&TABS),
                lifecycle: FsLifecycleStore,
                ledger: FilingLedger::in_memory().unwrap(),
                layout: Layout::default(),
                _tmp: tmp,
            }
        }

        fn driver(&self) -> BatchDriver<'_> {
            BatchDriver {
                oracle: &self.oracle,
                tracking: &self.tracking,
                template: &self.template,
                lifecycle: &self.lifecycle,
                ledger: &self.ledger,
                layout: &self.layout,
                policy: ConsistencyPolicy {
                    enabled: false,
                    max_attempts: 3,
                },
                intake_dir: &self.intake,
                filing_root: &self.root,
            }
        }

        fn queue(&self, name: &str, body: &str) -> PathBuf {
            let path = self.intake.join(name);
            fs::write(&path, body).unwrap();
            path
        }
    }

    fn master() -> serde_json::Value {
        json!({"Order#": "PO555-MASTER", "Style#": "AB12-PT", "Size 0": 3, "Size 2": 4, "Total": 7})
    }

    fn ga1() -> serde_json::Value {
        json!({"Order#": "PO555-GA1", "Style#": "AB12-PT", "Size 0": 1, "Total": 1})
    }

    #[tokio::test]
    async fn test_master_then_location() {
        let fx = Fixture::new(&[master(), ga1()]);
        fx.queue("a_master.pdf", "%PDF master");
        fx.queue("b_ga1.PDF", "%PDF ga1");
        fx.queue("notes.txt", "ignored");

        let summary = fx.driver().run().await.unwrap();
        assert_eq!(summary.filed.len(), 2);
        assert_eq!(summary.workbooks_created(), 1);
        assert_eq!(summary.per_location().get("GA1"), Some(&1));

        let dest = fx.root.join("AB12/PO/PO555_AB12-PT");
        let book = FiledWorkbook::read(&dest.join("PO_PO555-MASTER.xlsx"));
        assert_eq!(book.tabs, vec!["Petite".to_string()]);
        assert_eq!(book.value("C12"), Data::Float(3.0));
        assert_eq!(book.value("D12"), Data::Float(4.0));
        assert_eq!(book.value("C14"), Data::Float(1.0));
        assert_eq!(book.text("G6"), "PO555");
        assert_eq!(book.formula(TOTALS_CELL), "SUM(C12:L19)");

        let rows = fx.tracking.rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], vec!["AB12-PT", "PO555", "MASTER", "3", "4", "7"]);
        assert_eq!(rows[2], vec!["AB12-PT", "PO555", "GA1", "1", "", "1"]);

        assert!(dest.join("a_master.pdf").is_file());
        assert!(dest.join("b_ga1.PDF").is_file());
        assert_eq!(list_intake(&fx.intake).unwrap(), Vec::<PathBuf>::new());
        assert_eq!(fx.ledger.get_counts().unwrap(), (2, 1));
    }

    #[tokio::test]
    async fn test_location_before_master_halts_without_side_effects() {
        let fx = Fixture::new(&[ga1(), master()]);
        let ga1_path = fx.queue("a_ga1.pdf", "%PDF ga1");
        let master_path = fx.queue("b_master.pdf", "%PDF master");

        let err = fx.driver().run().await.unwrap_err();
        assert_eq!(err.stage, Stage::Classified);
        assert_eq!(err.tracking_row, None);
        assert!(matches!(err.source, FilingError::MasterNotYetProcessed { .. }));

        assert_eq!(fx.tracking.rows().len(), 1);
        assert!(!fx.root.join("AB12").exists());
        assert!(ga1_path.is_file());
        assert!(master_path.is_file());
        assert_eq!(fx.oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_refiling_same_pdf_is_rejected() {
        let fx = Fixture::new(&[master()]);
        fx.queue("po.pdf", "%PDF master");
        fx.driver().run().await.unwrap();

        let again = fx.queue("po copy.pdf", "%PDF master");
        let err = fx.driver().process_file(&again).await.unwrap_err();
        assert_eq!(err.stage, Stage::Pending);
        assert!(matches!(err.source, FilingError::AlreadyFiled { .. }));
        assert_eq!(fx.oracle.calls(), 1);
        assert_eq!(fx.tracking.rows().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_export_reports_tracking_row() {
        let fx = Fixture::new(&[master()]);
        fx.template.fail_exports(true);
        let pdf = fx.queue("po.pdf", "%PDF master");

        let err = fx.driver().process_file(&pdf).await.unwrap_err();
        assert_eq!(err.stage, Stage::Gated);
        assert_eq!(err.tracking_row, Some(2));
        assert!(err.remediation().contains("delete row 2"));
        assert!(matches!(err.source, FilingError::SinkWriteFailure(_)));

        // The MASTER can be re-run once the template is reachable again.
        assert!(!fx.root.join("AB12/PO/PO555_AB12-PT").exists());
        assert!(!fx.root.join("AB12").exists());
        assert!(fx.root.is_dir());
        assert!(pdf.is_file());
    }

    #[tokio::test]
    async fn test_check_writes_nothing() {
        let fx = Fixture::new(&[ga1()]);
        let pdf = fx.queue("ga1.pdf", "%PDF ga1");

        let report = fx.driver().check_file(&pdf).await.unwrap();
        assert_eq!(report.category, "petite");
        assert_eq!(report.location, "GA1");
        assert_eq!(report.gate, "blocked: MASTER not filed yet");
        assert!(report.cells.contains(&("C14".to_string(), "1".to_string())));
        assert!(report.already_filed_into.is_none());

        assert_eq!(fx.tracking.rows().len(), 1);
        assert!(pdf.is_file());
        assert!(!fx.root.join("AB12").exists());
    }

    #[test]
    fn test_intake_order_breaks_ties_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["c.pdf", "a.pdf", "b.Pdf"] {
            fs::write(tmp.path().join(name), "x").unwrap();
        }
        let stamp = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        for name in ["c.pdf", "a.pdf", "b.Pdf"] {
            fs::File::options()
                .write(true)
                .open(tmp.path().join(name))
                .unwrap()
                .set_modified(stamp)
                .unwrap();
        }
        fs::create_dir(tmp.path().join("dir.pdf")).unwrap();

        let names: Vec<String> = list_intake(tmp.path())
            .unwrap()
            .iter()
            .map(|p| display_name(p))
            .collect();
        assert_eq!(names, vec!["a.pdf", "b.Pdf", "c.pdf"]);
    }

    #[test]
    fn test_archive_replaces_existing_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("dest");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("po.pdf"), "old").unwrap();
        let pdf = tmp.path().join("po.pdf");
        fs::write(&pdf, "new").unwrap();

        let target = archive(&pdf, &dest).unwrap();
        assert_eq!(fs::read_to_string(target).unwrap(), "new");
        assert!(!pdf.exists());
    }
}
