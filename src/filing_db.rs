use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, params};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;

/// Ledger of PDFs that have been filed, keyed by content hash.
pub struct FilingLedger {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiledDocument {
    pub pdf_sha256: String,
    pub filename: String,
    pub style: String,
    pub company_po: String,
    pub location: String,
    pub category: String,
    pub destination: String,
    pub tracking_row: Option<u32>,
    pub filed_at: String,
}

/// What a successful filing leaves behind.
#[derive(Debug, Clone)]
pub struct NewFiling<'a> {
    pub pdf_sha256: &'a str,
    pub filename: &'a str,
    pub style: &'a str,
    pub company_po: &'a str,
    pub location: &'a str,
    pub category: &'a str,
    pub destination: &'a str,
    pub tracking_row: Option<u32>,
}

impl FilingLedger {
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        Self::init(Connection::open(db_path)?)
    }

    pub fn in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS filings (
                pdf_sha256 TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                style TEXT NOT NULL,
                company_po TEXT NOT NULL,
                location TEXT NOT NULL,
                category TEXT NOT NULL,
                destination TEXT NOT NULL,
                tracking_row INTEGER,
                filed_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_filings_destination ON filings(destination)",
            [],
        )?;

        info!("Filing ledger initialized");
        Ok(Self { conn })
    }

    /// Hex SHA-256 of the PDF bytes.
    pub fn document_hash(pdf: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(pdf);
        format!("{:x}", hasher.finalize())
    }

    pub fn find_filing(&self, pdf_sha256: &str) -> SqliteResult<Option<FiledDocument>> {
        self.conn
            .query_row(
                "SELECT pdf_sha256, filename, style, company_po, location, category, destination,
                        tracking_row, filed_at
                 FROM filings
                 WHERE pdf_sha256 = ?1",
                params![pdf_sha256],
                |row| {
                    Ok(FiledDocument {
                        pdf_sha256: row.get(0)?,
                        filename: row.get(1)?,
                        style: row.get(2)?,
                        company_po: row.get(3)?,
                        location: row.get(4)?,
                        category: row.get(5)?,
                        destination: row.get(6)?,
                        tracking_row: row.get(7)?,
                        filed_at: row.get(8)?,
                    })
                },
            )
            .optional()
    }

    pub fn record_filing(&self, filing: &NewFiling<'_>) -> SqliteResult<()> {
        self.conn.execute(
            "INSERT INTO filings
                (pdf_sha256, filename, style, company_po, location, category, destination, tracking_row)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(pdf_sha256) DO UPDATE SET
                filename = excluded.filename,
                destination = excluded.destination,
                tracking_row = excluded.tracking_row",
            params![
                filing.pdf_sha256,
                filing.filename,
                filing.style,
                filing.company_po,
                filing.location,
                filing.category,
                filing.destination,
                filing.tracking_row,
            ],
        )?;
        info!(filename = %filing.filename, destination = %filing.destination, "Filing recorded");
        Ok(())
    }

    /// Drop a ledger entry so the same PDF can be filed again. Returns whether an
    /// entry existed.
    pub fn forget(&self, pdf_sha256: &str) -> SqliteResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM filings WHERE pdf_sha256 = ?1", params![pdf_sha256])?;
        Ok(removed > 0)
    }

    /// (documents filed, distinct destinations)
    pub fn get_counts(&self) -> SqliteResult<(usize, usize)> {
        let filed: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM filings", [], |row| row.get(0))?;
        let destinations: usize = self.conn.query_row(
            "SELECT COUNT(DISTINCT destination) FROM filings",
            [],
            |row| row.get(0),
        )?;
        Ok((filed, destinations))
    }
}
