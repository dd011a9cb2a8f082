// src/layout.rs

//! The destination layout as configuration: size label aliasing, which tab variants
//! exist, the tab name for each category and the row used by each location.
//!
//! Every difference between the hand-forked filing scripts this tool replaces is one
//! of these knobs rather than a separate code path.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

pub const MASTER: &str = "MASTER";

/// A garment size column. Numeric sizes run 0..=24 in steps of two; `00` exists on
/// some regular and petite orders only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Size {
    DoubleZero,
    Even(u8),
}

/// Every size the extraction prompt asks for, in column order.
pub const ALL_SIZES: [Size; 14] = [
    Size::DoubleZero,
    Size::Even(0),
    Size::Even(2),
    Size::Even(4),
    Size::Even(6),
    Size::Even(8),
    Size::Even(10),
    Size::Even(12),
    Size::Even(14),
    Size::Even(16),
    Size::Even(18),
    Size::Even(20),
    Size::Even(22),
    Size::Even(24),
];

impl Size {
    /// Bare size number as printed on the PO ("00", "0", "16").
    pub fn base(&self) -> String {
        match self {
            Size::DoubleZero => "00".to_string(),
            Size::Even(n) => n.to_string(),
        }
    }

    /// Key the extraction oracle uses for this size ("Size 00", "Size 16").
    pub fn raw_key(&self) -> String {
        format!("Size {}", self.base())
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base())
    }
}

/// How sizes 16/18/20 are labelled in the tracking sheet (they double as 1X/2X/3X).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeLabels {
    /// `16/1X`
    #[default]
    SlashUpper,
    /// `16/1x`
    SlashLower,
    /// `16 / 1X`
    SpacedUpper,
}

impl SizeLabels {
    pub fn label(&self, size: Size) -> String {
        let plus = match size {
            Size::Even(16) => "1X",
            Size::Even(18) => "2X",
            Size::Even(20) => "3X",
            _ => return size.base(),
        };
        match self {
            SizeLabels::SlashUpper => format!("{}/{plus}", size.base()),
            SizeLabels::SlashLower => format!("{}/{}", size.base(), plus.to_lowercase()),
            SizeLabels::SpacedUpper => format!("{} / {plus}", size.base()),
        }
    }
}

/// Garment size category; selects the template tab and its column layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Regular,
    RegularWith00,
    Petite,
    PetiteWith00,
    Plus,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Regular => "regular",
            Category::RegularWith00 => "regular-with-00",
            Category::Petite => "petite",
            Category::PetiteWith00 => "petite-with-00",
            Category::Plus => "plus",
        };
        f.write_str(name)
    }
}

/// Template tab name per category.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TabNames {
    pub regular: String,
    pub regular_00: String,
    pub petite: String,
    pub petite_00: String,
    pub plus: String,
}

impl Default for TabNames {
    fn default() -> Self {
        Self {
            regular: "Regular".to_string(),
            regular_00: "Reg_00".to_string(),
            petite: "Petite".to_string(),
            petite_00: "Petite_00".to_string(),
            plus: "Plus".to_string(),
        }
    }
}

impl TabNames {
    pub fn tab(&self, category: Category) -> &str {
        match category {
            Category::Regular => &self.regular,
            Category::RegularWith00 => &self.regular_00,
            Category::Petite => &self.petite,
            Category::PetiteWith00 => &self.petite_00,
            Category::Plus => &self.plus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Layout {
    pub size_labels: SizeLabels,
    /// Whether the template has `00` tabs for regular and petite orders.
    pub zero_zero_variants: bool,
    /// Whether MASTER writes the unit price header cell.
    pub unit_price: bool,
    pub tabs: TabNames,
    pub location_rows: BTreeMap<String, u32>,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            size_labels: SizeLabels::default(),
            zero_zero_variants: true,
            unit_price: false,
            tabs: TabNames::default(),
            location_rows: default_location_rows(),
        }
    }
}

fn default_location_rows() -> BTreeMap<String, u32> {
    [(MASTER, 12), ("GA1", 14), ("AZ1", 16), ("PL1", 18)]
        .into_iter()
        .map(|(loc, row)| (loc.to_string(), row))
        .collect()
}

impl Layout {
    /// Row used by every size column of `location`, if the location is known.
    pub fn row_for(&self, location: &str) -> Option<u32> {
        self.location_rows
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(location))
            .map(|(_, row)| *row)
    }

    pub fn label(&self, size: Size) -> String {
        self.size_labels.label(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_styles() {
        assert_eq!(SizeLabels::SlashUpper.label(Size::Even(16)), "16/1X");
        assert_eq!(SizeLabels::SlashLower.label(Size::Even(18)), "18/2x");
        assert_eq!(SizeLabels::SpacedUpper.label(Size::Even(20)), "20 / 3X");
        assert_eq!(SizeLabels::SlashLower.label(Size::Even(22)), "22");
        assert_eq!(SizeLabels::SlashUpper.label(Size::DoubleZero), "00");
    }

    #[test]
    fn test_raw_keys() {
        assert_eq!(Size::DoubleZero.raw_key(), "Size 00");
        assert_eq!(Size::Even(0).raw_key(), "Size 0");
    }

    #[test]
    fn test_default_rows_case_insensitive() {
        let layout = Layout::default();
        assert_eq!(layout.row_for("MASTER"), Some(12));
        assert_eq!(layout.row_for("ga1"), Some(14));
        assert_eq!(layout.row_for("TX9"), None);
    }

    #[test]
    fn test_tab_names() {
        let tabs = TabNames::default();
        assert_eq!(tabs.tab(Category::PetiteWith00), "Petite_00");
        assert_eq!(tabs.tab(Category::Plus), "Plus");
    }
}
