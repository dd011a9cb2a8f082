// src/cellmap.rs

use crate::classify::Location;
use crate::error::{FilingError, Result};
use crate::layout::{Category, Layout, Size};
use crate::record::{CellField, Field};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static A1_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z]{1,3})([1-9][0-9]*)$").expect("valid A1 pattern"));

/// A single-cell A1 reference such as `C12`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellRef {
    column: String,
    row: u32,
}

impl CellRef {
    pub fn new(column: &str, row: u32) -> Self {
        Self {
            column: column.to_ascii_uppercase(),
            row,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn row(&self) -> u32 {
        self.row
    }

    /// Zero-based (row, column).
    pub fn indices(&self) -> (u32, u16) {
        (self.row - 1, column_index(&self.column))
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.column, self.row)
    }
}

impl FromStr for CellRef {
    type Err = FilingError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = A1_RE
            .captures(s.trim())
            .ok_or_else(|| FilingError::Workbook(format!("not a cell reference: {s:?}")))?;
        let row = caps[2]
            .parse::<u32>()
            .map_err(|e| FilingError::Workbook(format!("bad row in {s:?}: {e}")))?;
        Ok(CellRef::new(&caps[1], row))
    }
}

/// `0 -> A`, `25 -> Z`, `26 -> AA`.
pub fn column_letters(index: u16) -> String {
    let mut n = index as u32 + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        letters.push((b'A' + rem) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Inverse of [`column_letters`]. Expects uppercase ASCII letters.
pub fn column_index(letters: &str) -> u16 {
    let n = letters
        .bytes()
        .fold(0u32, |acc, b| acc * 26 + (b.to_ascii_uppercase() - b'A' + 1) as u32);
    (n - 1) as u16
}

/// Header cells written once, by the MASTER record.
const HEADER_CELLS: [(Field, &str); 8] = [
    (Field::CompanyPo, "G6"),
    (Field::Description, "A10"),
    (Field::Style, "A11"),
    (Field::PoIssue, "M6"),
    (Field::Cxl, "M8"),
    (Field::Color, "A12"),
    (Field::Total, "M25"),
    (Field::UnitPrice, "N12"),
];

/// First size column on every template tab.
const FIRST_SIZE_COLUMN: u16 = 2; // C

/// Sizes printed on a category's tab, left to right.
pub fn category_sizes(category: Category) -> Vec<Size> {
    let evens = |from: u8, to: u8| (from..=to).step_by(2).map(Size::Even);
    match category {
        Category::Regular => evens(0, 16).collect(),
        Category::RegularWith00 => std::iter::once(Size::DoubleZero).chain(evens(0, 16)).collect(),
        Category::Petite => evens(0, 14).collect(),
        Category::PetiteWith00 => std::iter::once(Size::DoubleZero).chain(evens(0, 14)).collect(),
        Category::Plus => evens(14, 24).collect(),
    }
}

/// Field -> cell address for one (category, location) destination.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CellMap(BTreeMap<CellField, CellRef>);

impl CellMap {
    pub fn get(&self, field: CellField) -> Option<&CellRef> {
        self.0.get(&field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CellField, &CellRef)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Only the size entries.
    pub fn sizes(&self) -> impl Iterator<Item = (Size, &CellRef)> {
        self.0.iter().filter_map(|(field, cell)| match field {
            CellField::Size(size) => Some((*size, cell)),
            CellField::Header(_) => None,
        })
    }
}

pub fn build_cell_map(category: Category, location: &Location, layout: &Layout) -> Result<CellMap> {
    let row = layout.row_for(location.as_str()).ok_or_else(|| {
        FilingError::InvalidCategoryOrLocation(format!("no row configured for {location}"))
    })?;

    let mut map = BTreeMap::new();
    if location.is_master() {
        for (field, cell) in HEADER_CELLS {
            if field == Field::UnitPrice && !layout.unit_price {
                continue;
            }
            map.insert(CellField::Header(field), cell.parse::<CellRef>()?);
        }
    }
    for (offset, size) in category_sizes(category).into_iter().enumerate() {
        let column = column_letters(FIRST_SIZE_COLUMN + offset as u16);
        map.insert(CellField::Size(size), CellRef::new(&column, row));
    }
    Ok(CellMap(map))
}
