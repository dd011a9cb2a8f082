// src/record.rs

//! Field normalization: turns the oracle's loosely keyed output into the canonical
//! record every downstream step works on.

use crate::error::{FilingError, Result};
use crate::layout::{ALL_SIZES, Size, SizeLabels};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Flat key/value object as returned by the extraction oracle. Keys are whatever the
/// model chose to emit; nothing about them is trusted yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawExtraction(Map<String, Value>);

impl RawExtraction {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn parse(json: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(json) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(FilingError::InvalidExtraction(format!(
                "expected an object, got {other}"
            ))),
            Err(e) => Err(FilingError::InvalidExtraction(format!("{e}\nRaw: {json}"))),
        }
    }

    /// Remove and return the first value whose key matches one of `aliases`
    /// (case and whitespace are ignored).
    fn take(&mut self, aliases: &[&str]) -> Option<String> {
        let wanted: Vec<String> = aliases.iter().map(|a| column_key(a)).collect();
        let key = self
            .0
            .keys()
            .find(|k| wanted.contains(&column_key(k)))
            .cloned()?;
        self.0.remove(&key).map(|v| value_text(&v))
    }
}

/// Scalar fields of the canonical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    CompanyPo,
    Location,
    Style,
    Color,
    Total,
    PoIssue,
    Cxl,
    Inseam,
    Description,
    UnitPrice,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::CompanyPo,
        Field::Location,
        Field::Style,
        Field::Color,
        Field::Total,
        Field::PoIssue,
        Field::Cxl,
        Field::Inseam,
        Field::Description,
        Field::UnitPrice,
    ];

    pub fn canonical_name(&self) -> &'static str {
        match self {
            Field::CompanyPo => "companyPO",
            Field::Location => "location",
            Field::Style => "style",
            Field::Color => "color",
            Field::Total => "total",
            Field::PoIssue => "poIssue",
            Field::Cxl => "cxl",
            Field::Inseam => "inseam",
            Field::Description => "description",
            Field::UnitPrice => "unitPrice",
        }
    }

    /// Tracking-sheet headers this field fills, besides its canonical name.
    fn headers(&self) -> &'static [&'static str] {
        match self {
            Field::CompanyPo => &["Company PO#"],
            Field::Location => &["Location"],
            Field::Style => &["STYLE#"],
            Field::Color => &["Color"],
            Field::Total => &["Total"],
            Field::PoIssue => &["PO ISSUE", "PO ISSUE (Date)"],
            Field::Cxl => &["CXL"],
            Field::Inseam => &["Inseam"],
            Field::Description => &["DESCRIPTION"],
            Field::UnitPrice => &["C Price"],
        }
    }

    /// Keys the oracle may use for this field. Order identifier and location are
    /// handled separately because they are derived.
    fn raw_aliases(&self) -> &'static [&'static str] {
        match self {
            Field::Style => &["STYLE#", "Style", "Style Number"],
            Field::Color => &["Color", "Colour"],
            Field::Total => &["Total"],
            Field::PoIssue => &["PO ISSUE", "PO ISSUE (Date)", "PO Issue Date"],
            Field::Cxl => &["Requested Ship Date", "CXL"],
            Field::Inseam => &["Inseam Size", "Jean Size", "Inseam"],
            Field::Description => &["DESCRIPTION", "Description line item comments"],
            Field::UnitPrice => &["C Price", "Unit Price"],
            Field::CompanyPo | Field::Location => &[],
        }
    }
}

/// Anything a cell map can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CellField {
    Header(Field),
    Size(Size),
}

const ORDER_ALIASES: &[&str] = &["Order#", "Order", "Order Number"];
const LOCATION_ALIASES: &[&str] = &["Location"];

/// The normalized record for one purchase-order PDF.
///
/// Every field is always present; a missing value is the empty string, which lands
/// as a blank cell downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRecord {
    pub company_po: String,
    pub location: String,
    pub style: String,
    pub color: String,
    pub total: String,
    pub po_issue: String,
    pub cxl: String,
    pub inseam: String,
    pub description: String,
    pub unit_price: String,
    pub sizes: BTreeMap<Size, String>,
    /// Keys the oracle returned that have no canonical meaning (e.g. "Vendor").
    pub extra: BTreeMap<String, String>,
}

impl CanonicalRecord {
    pub fn field(&self, field: Field) -> &str {
        match field {
            Field::CompanyPo => &self.company_po,
            Field::Location => &self.location,
            Field::Style => &self.style,
            Field::Color => &self.color,
            Field::Total => &self.total,
            Field::PoIssue => &self.po_issue,
            Field::Cxl => &self.cxl,
            Field::Inseam => &self.inseam,
            Field::Description => &self.description,
            Field::UnitPrice => &self.unit_price,
        }
    }

    pub fn size(&self, size: Size) -> &str {
        self.sizes.get(&size).map(String::as_str).unwrap_or("")
    }

    pub fn value(&self, field: CellField) -> &str {
        match field {
            CellField::Header(f) => self.field(f),
            CellField::Size(s) => self.size(s),
        }
    }

    /// Look up a tracking-sheet column by header text. Unknown headers yield `None`.
    pub fn column(&self, header: &str, labels: SizeLabels) -> Option<&str> {
        let key = column_key(header);
        if key.is_empty() {
            return None;
        }
        for field in Field::ALL {
            if column_key(field.canonical_name()) == key
                || field.headers().iter().any(|h| column_key(h) == key)
            {
                return Some(self.field(field));
            }
        }
        for size in ALL_SIZES {
            if column_key(&labels.label(size)) == key || column_key(&size.base()) == key {
                return Some(self.size(size));
            }
        }
        self.extra
            .iter()
            .find(|(k, _)| column_key(k) == key)
            .map(|(_, v)| v.as_str())
    }

    /// Record as ordered (name, value) pairs using canonical names and size labels.
    pub fn columns(&self, labels: SizeLabels) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Field::ALL
            .iter()
            .map(|f| (f.canonical_name().to_string(), self.field(*f).to_string()))
            .collect();
        out.extend(
            ALL_SIZES
                .iter()
                .map(|s| (labels.label(*s), self.size(*s).to_string())),
        );
        out.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }
}

/// Normalize one raw extraction.
pub fn normalize(raw: RawExtraction) -> Result<CanonicalRecord> {
    let mut raw = raw;

    let order = raw.take(ORDER_ALIASES).unwrap_or_default();
    let Some((company_po, rest)) = order.split_once('-') else {
        return Err(FilingError::MalformedOrderIdentifier(order));
    };
    let company_po = company_po.trim().to_string();
    if company_po.is_empty() {
        return Err(FilingError::MalformedOrderIdentifier(order));
    }
    let segment = rest.split('-').next().unwrap_or("").trim().to_string();

    let location = match raw.take(LOCATION_ALIASES) {
        Some(explicit) if !explicit.is_empty() => explicit,
        _ => segment,
    }
    .to_uppercase();

    let mut take = |field: Field| raw.take(field.raw_aliases()).unwrap_or_default();
    let style = take(Field::Style);
    let color = take(Field::Color);
    let total = take(Field::Total);
    let po_issue = take(Field::PoIssue);
    let cxl = take(Field::Cxl);
    let inseam = take(Field::Inseam);
    let description = take(Field::Description);
    let unit_price = take(Field::UnitPrice);

    let sizes = ALL_SIZES
        .iter()
        .map(|size| {
            let qty = raw.take(&[size.raw_key().as_str()]).unwrap_or_default();
            (*size, qty)
        })
        .collect();

    let extra = raw
        .0
        .iter()
        .map(|(k, v)| (k.trim().to_string(), value_text(v)))
        .collect();

    Ok(CanonicalRecord {
        company_po,
        location,
        style,
        color,
        total,
        po_issue,
        cxl,
        inseam,
        description,
        unit_price,
        sizes,
        extra,
    })
}

/// Text form of a JSON value as it should appear in a cell.
fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Comparison key for headers and raw keys: lowercase, whitespace removed.
pub fn column_key(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawExtraction {
        match value {
            Value::Object(map) => RawExtraction::new(map),
            _ => panic!("test input must be an object"),
        }
    }

    #[test]
    fn test_company_po_and_location_from_order() {
        for (order, po, loc) in [
            ("PO555-MASTER", "PO555", "MASTER"),
            ("A1174098-MASTER-US", "A1174098", "MASTER"),
            ("A1174098-ga1", "A1174098", "GA1"),
            ("X-Y-Z", "X", "Y"),
        ] {
            let record = normalize(raw(json!({ "Order#": order }))).unwrap();
            assert_eq!(record.company_po, po);
            assert_eq!(record.location, loc);
        }
    }

    #[test]
    fn test_explicit_location_wins() {
        let record = normalize(raw(json!({
            "Order#": "A1174098-MASTER",
            "Location": "az1"
        })))
        .unwrap();
        assert_eq!(record.location, "AZ1");
        assert!(record.extra.is_empty());
    }

    #[test]
    fn test_blank_explicit_location_falls_back_to_order() {
        let record = normalize(raw(json!({ "Order#": "A1-PL1", "Location": "" }))).unwrap();
        assert_eq!(record.location, "PL1");
    }

    #[test]
    fn test_malformed_order() {
        let err = normalize(raw(json!({ "Order#": "A1174098" }))).unwrap_err();
        assert!(matches!(err, FilingError::MalformedOrderIdentifier(o) if o == "A1174098"));

        let err = normalize(raw(json!({ "Style#": "AB12" }))).unwrap_err();
        assert!(matches!(err, FilingError::MalformedOrderIdentifier(_)));

        let err = normalize(raw(json!({ "Order#": "-MASTER" }))).unwrap_err();
        assert!(matches!(err, FilingError::MalformedOrderIdentifier(_)));
    }

    #[test]
    fn test_renames_and_sizes() {
        let record = normalize(raw(json!({
            "Order#": "PO555-MASTER",
            "Style#": "AB12-PT",
            "Color": "Medium Wash",
            "Size 0": "3",
            "Size 16": 2,
            "Size 24": null,
            "Total": 5,
            "Requested Ship Date": "6/25/2025",
            "Jean Size": 31,
            "PO ISSUE (Date)": "1/27",
            "Description": "Pocket Wide Leg Jean",
            "Vendor": "ACME"
        })))
        .unwrap();

        assert_eq!(record.style, "AB12-PT");
        assert_eq!(record.cxl, "6/25/2025");
        assert_eq!(record.inseam, "31");
        assert_eq!(record.po_issue, "1/27");
        assert_eq!(record.total, "5");
        assert_eq!(record.size(Size::Even(0)), "3");
        assert_eq!(record.size(Size::Even(16)), "2");
        assert_eq!(record.size(Size::Even(24)), "");
        assert_eq!(record.size(Size::DoubleZero), "");
        assert_eq!(record.sizes.len(), ALL_SIZES.len());
        assert_eq!(record.extra.get("Vendor").map(String::as_str), Some("ACME"));
    }

    #[test]
    fn test_inseam_size_key_variant() {
        let record = normalize(raw(json!({
            "Order#": "A1-MASTER",
            "STYLE#": "WD1017-SF",
            "Inseam Size": "30",
            "DESCRIPTION": "Jean"
        })))
        .unwrap();
        assert_eq!(record.inseam, "30");
        assert_eq!(record.style, "WD1017-SF");
        assert_eq!(record.description, "Jean");
    }

    #[test]
    fn test_columns_follow_label_style() {
        let record = normalize(raw(json!({ "Order#": "PO555-MASTER", "Size 16": "2" }))).unwrap();
        assert_eq!(record.column("16/1X", SizeLabels::SlashUpper), Some("2"));
        assert_eq!(record.column("16 / 1x", SizeLabels::SlashLower), Some("2"));
        assert_eq!(record.column(" Company PO# ", SizeLabels::SlashUpper), Some("PO555"));
        assert_eq!(record.column("companyPO", SizeLabels::SlashUpper), Some("PO555"));
        assert_eq!(record.column("Ordered QTY", SizeLabels::SlashUpper), None);

        let columns = record.columns(SizeLabels::SlashLower);
        assert!(columns.contains(&("16/1x".to_string(), "2".to_string())));
        assert!(columns.contains(&("location".to_string(), "MASTER".to_string())));
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(RawExtraction::parse(r#"{"Order#": "A-B"}"#).is_ok());
        assert!(matches!(
            RawExtraction::parse("[1, 2]"),
            Err(FilingError::InvalidExtraction(_))
        ));
        assert!(matches!(
            RawExtraction::parse("not json"),
            Err(FilingError::InvalidExtraction(_))
        ));
    }
}
