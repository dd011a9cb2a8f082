// src/classify.rs

use crate::error::{FilingError, Result};
use crate::layout::{Category, Layout, MASTER, Size};
use crate::record::CanonicalRecord;
use std::fmt;
use std::path::{Path, PathBuf};

/// Where a PO's quantities are shipped. MASTER is the whole order and must be filed
/// before any site-specific split of the same order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Master,
    Site(String),
}

impl Location {
    /// Validate a normalized location against the configured row table.
    pub fn parse(raw: &str, layout: &Layout) -> Result<Self> {
        let upper = raw.trim().to_uppercase();
        if upper.is_empty() {
            return Err(FilingError::InvalidCategoryOrLocation(
                "the order identifier carries no location".to_string(),
            ));
        }
        if layout.row_for(&upper).is_none() {
            return Err(FilingError::InvalidCategoryOrLocation(format!(
                "unknown location {upper:?}"
            )));
        }
        if upper == MASTER {
            Ok(Location::Master)
        } else {
            Ok(Location::Site(upper))
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Location::Master)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Location::Master => MASTER,
            Location::Site(code) => code,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic home of one (style, company PO) pair:
/// `{root}/{styleBase}/PO/{companyPO}_{fullStyle}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub dir: PathBuf,
    pub style_base: String,
    pub full_style: String,
    pub company_po: String,
}

impl Destination {
    pub fn new(root: &Path, full_style: &str, company_po: &str) -> Result<Self> {
        check_path_segment(full_style)
            .map_err(|_| FilingError::MalformedStyle(full_style.to_string()))?;
        check_path_segment(company_po)
            .map_err(|_| FilingError::MalformedOrderIdentifier(company_po.to_string()))?;

        let style_base = match style_suffix(full_style) {
            Some(tag @ ("PT" | "P")) => full_style[..full_style.len() - tag.len() - 1].to_string(),
            _ => full_style.to_string(),
        };
        if style_base.is_empty() {
            return Err(FilingError::MalformedStyle(full_style.to_string()));
        }

        let dir = root
            .join(&style_base)
            .join("PO")
            .join(format!("{company_po}_{full_style}"));
        Ok(Self {
            dir,
            style_base,
            full_style: full_style.to_string(),
            company_po: company_po.to_string(),
        })
    }

    /// The one workbook per destination, created by the MASTER record.
    pub fn workbook_path(&self) -> PathBuf {
        self.dir.join(format!("PO_{}-{MASTER}.xlsx", self.company_po))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: Category,
    pub location: Location,
    pub destination: Destination,
}

/// Text after the last `-` of a style number, if any.
fn style_suffix(style: &str) -> Option<&str> {
    style.rsplit_once('-').map(|(_, suffix)| suffix)
}

/// Category from the style suffix and whether a `00` quantity was ordered.
pub fn category_for(style: &str, has_double_zero: bool, layout: &Layout) -> Category {
    let promote = has_double_zero && layout.zero_zero_variants;
    match style_suffix(style) {
        Some("P") => Category::Plus,
        Some("PT") if promote => Category::PetiteWith00,
        Some("PT") => Category::Petite,
        _ if promote => Category::RegularWith00,
        _ => Category::Regular,
    }
}

pub fn classify(record: &CanonicalRecord, layout: &Layout, root: &Path) -> Result<Classification> {
    let style = record.style.trim();
    let has_double_zero = !record.size(Size::DoubleZero).trim().is_empty();
    let category = category_for(style, has_double_zero, layout);
    let location = Location::parse(&record.location, layout)?;
    let destination = Destination::new(root, style, record.company_po.trim())?;
    Ok(Classification {
        category,
        location,
        destination,
    })
}

fn check_path_segment(segment: &str) -> std::result::Result<(), ()> {
    let bad = segment.is_empty()
        || segment == "."
        || segment.contains("..")
        || segment.contains(['/', '\\', ':', '\0']);
    if bad { Err(()) } else { Ok(()) }
}
