// src/pdf_extract.rs

use crate::error::{FilingError, Result};
use lopdf::{Dictionary, Document};
use tracing::{info, warn};

/// What local text extraction made of a PO PDF.
#[derive(Debug)]
pub enum PdfContent {
    Text(String),
    /// Image-only pages; only a file-capable model can read these.
    ScannedImage,
    Error(String),
}

/// Fewer non-whitespace characters than this and the PDF is treated as scanned.
const MIN_TEXT_CHARS: usize = 30;

/// Share of image-only pages above which the whole document counts as scanned.
const SCANNED_RATIO: f64 = 0.8;

/// Parse the PDF structure and return its page count.
///
/// Used before uploading, so a truncated or non-PDF file in the intake folder fails
/// at extraction instead of costing a model call.
pub fn page_count(pdf_bytes: &[u8]) -> Result<usize> {
    let doc = Document::load_mem(pdf_bytes)
        .map_err(|e| FilingError::UnreadablePdf(format!("failed to parse PDF: {e}")))?;
    match doc.get_pages().len() {
        0 => Err(FilingError::UnreadablePdf("PDF has no pages".into())),
        n => Ok(n),
    }
}

pub fn extract_text_from_pdf(pdf_bytes: &[u8]) -> PdfContent {
    let doc = match Document::load_mem(pdf_bytes) {
        Ok(d) => d,
        Err(e) => return PdfContent::Error(format!("Failed to parse PDF: {e}")),
    };

    if looks_like_scanned(&doc) {
        info!("PDF structural check: likely scanned");
        return PdfContent::ScannedImage;
    }

    match pdf_extract::extract_text_from_mem(pdf_bytes) {
        Ok(text) => {
            let meaningful = text.chars().filter(|c| !c.is_whitespace()).count();
            if meaningful < MIN_TEXT_CHARS {
                info!(chars = meaningful, "Extracted text too short, treating as scanned");
                PdfContent::ScannedImage
            } else {
                info!(chars = meaningful, "Text extracted");
                PdfContent::Text(text)
            }
        }
        Err(e) => {
            warn!(error = %e, "pdf-extract failed, may be scanned or corrupted");
            PdfContent::ScannedImage
        }
    }
}

/// A page with XObject images but no fonts is almost certainly a scan.
fn looks_like_scanned(doc: &Document) -> bool {
    let pages = doc.get_pages();
    if pages.is_empty() {
        return false;
    }

    let image_only = pages
        .values()
        .filter_map(|id| doc.get_object(*id).ok()?.as_dict().ok())
        .filter(|page| {
            !resource_is_empty(doc, page, b"XObject") && resource_is_empty(doc, page, b"Font")
        })
        .count();

    let ratio = image_only as f64 / pages.len() as f64;
    info!(
        total_pages = pages.len(),
        image_only,
        ratio = format!("{ratio:.2}"),
        "Scanned-page analysis"
    );
    ratio >= SCANNED_RATIO
}

/// True when the page's `Resources/<key>` dictionary is absent or empty.
fn resource_is_empty(doc: &Document, page: &Dictionary, key: &[u8]) -> bool {
    let entries = page
        .get(b"Resources")
        .ok()
        .and_then(|r| doc.dereference(r).ok())
        .and_then(|(_, res)| res.as_dict().ok())
        .and_then(|res| res.get(key).ok())
        .and_then(|obj| doc.dereference(obj).ok())
        .and_then(|(_, obj)| obj.as_dict().ok())
        .map(|dict| dict.len());
    entries.unwrap_or(0) == 0
}
