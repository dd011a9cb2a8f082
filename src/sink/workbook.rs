// src/sink/workbook.rs

//! Single-tab PO workbooks on disk.
//!
//! A filed workbook is the template export itself with the other tabs taken out of the
//! package. Cells are edited inside the worksheet XML, so formulas, merged ranges,
//! styles and number types of the template survive the reduction and every patch.

use crate::cellmap::{CellRef, column_letters};
use crate::error::{FilingError, Result};
use crate::sink::is_plain_number;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS: &str = "xl/_rels/workbook.xml.rels";
const CONTENT_TYPES: &str = "[Content_Types].xml";
const CALC_CHAIN_TYPE: &str = "/calcChain";

/// Workbook children that come after `calcPr` in schema order.
const AFTER_CALC_PR: [&[u8]; 9] = [
    b"oleSize",
    b"customWorkbookViews",
    b"pivotCaches",
    b"smartTagPr",
    b"smartTagTypes",
    b"webPublishing",
    b"fileRecoveryPr",
    b"webPublishObjects",
    b"extLst",
];

type Parts = Vec<(String, Vec<u8>)>;

/// Pending cell values: row number -> zero-based column -> value.
type PendingCells = BTreeMap<u32, BTreeMap<u16, String>>;

/// An xlsx package holding one worksheet.
#[derive(Debug, Clone)]
pub struct PoWorkbook {
    parts: Parts,
    sheet_part: String,
    sheet_name: String,
}

struct SheetEntry {
    name: String,
    rel_id: Option<String>,
}

struct Relationship {
    id: String,
    kind: String,
    target: String,
}

impl Relationship {
    fn from_element(e: &BytesStart<'_>) -> Self {
        Self {
            id: attr(e, b"Id").unwrap_or_default(),
            kind: attr(e, b"Type").unwrap_or_default(),
            target: attr(e, b"Target").unwrap_or_default(),
        }
    }
}

impl PoWorkbook {
    /// Keep only `tab` out of an exported multi-tab workbook.
    pub fn from_export(bytes: &[u8], tab: &str) -> Result<Self> {
        let mut parts = read_package(bytes, "template export")?;
        let sheets = list_sheets(part(&parts, WORKBOOK_PART)?).map_err(xml_error(WORKBOOK_PART))?;
        let Some(keep) = sheets.iter().position(|s| s.name == tab) else {
            let names: Vec<&str> = sheets.iter().map(|s| s.name.as_str()).collect();
            return Err(FilingError::Workbook(format!(
                "exported workbook has no tab {tab:?} (tabs: {})",
                names.join(", ")
            )));
        };
        let rels = list_relationships(part(&parts, WORKBOOK_RELS)?).map_err(xml_error(WORKBOOK_RELS))?;
        let sheet_part = sheet_part_for(&rels, &sheets[keep])?;

        let dropped_ids: HashSet<&str> = sheets
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != keep)
            .filter_map(|(_, s)| s.rel_id.as_deref())
            .collect();
        let is_dropped =
            |rel: &Relationship| dropped_ids.contains(rel.id.as_str()) || rel.kind.ends_with(CALC_CHAIN_TYPE);

        let mut removed = HashSet::new();
        for rel in rels.iter().filter(|&rel| is_dropped(rel)) {
            let path = part_path(&rel.target);
            removed.insert(rels_part_of(&path));
            removed.insert(path);
        }

        let workbook_xml = reduce_workbook(part(&parts, WORKBOOK_PART)?, keep).map_err(xml_error(WORKBOOK_PART))?;
        let rels_xml = filter_elements(part(&parts, WORKBOOK_RELS)?, b"Relationship", |e| {
            is_dropped(&Relationship::from_element(e))
        })
        .map_err(xml_error(WORKBOOK_RELS))?;
        let types_xml = filter_elements(part(&parts, CONTENT_TYPES)?, b"Override", |e| {
            attr(e, b"PartName").is_some_and(|name| removed.contains(name.trim_start_matches('/')))
        })
        .map_err(xml_error(CONTENT_TYPES))?;

        parts.retain(|(name, _)| !removed.contains(name));
        replace_part(&mut parts, WORKBOOK_PART, workbook_xml);
        replace_part(&mut parts, WORKBOOK_RELS, rels_xml);
        replace_part(&mut parts, CONTENT_TYPES, types_xml);

        info!(tab = %tab, dropped = sheets.len() - 1, "Reduced export to one tab");
        Ok(Self {
            parts,
            sheet_part,
            sheet_name: tab.to_string(),
        })
    }

    /// Open a filed PO workbook; its first tab is the one that gets patched.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(FilingError::DestinationArtifactMissing(path.to_path_buf()));
        }
        let what = path.display().to_string();
        let parts = read_package(&fs::read(path)?, &what)?;
        let sheets = list_sheets(part(&parts, WORKBOOK_PART)?).map_err(xml_error(WORKBOOK_PART))?;
        let first = sheets
            .first()
            .ok_or_else(|| FilingError::Workbook(format!("{what} has no tabs")))?;
        let rels = list_relationships(part(&parts, WORKBOOK_RELS)?).map_err(xml_error(WORKBOOK_RELS))?;
        let sheet_part = sheet_part_for(&rels, first)?;
        let sheet_name = first.name.clone();
        Ok(Self {
            parts,
            sheet_part,
            sheet_name,
        })
    }

    pub fn sheet_name(&self) -> &str {
        &self.sheet_name
    }

    /// Write values into the tab. An empty value blanks the cell and keeps its style.
    pub fn set_cells(&mut self, cells: &[(CellRef, String)]) -> Result<()> {
        let mut pending = PendingCells::new();
        for (cell, value) in cells {
            let (row, col) = cell.indices();
            pending.entry(row + 1).or_default().insert(col, value.clone());
        }
        let patched = patch_sheet(part(&self.parts, &self.sheet_part)?, pending)
            .map_err(xml_error(&self.sheet_part))?;
        replace_part(&mut self.parts, &self.sheet_part, patched);
        debug!(sheet = %self.sheet_part, cells = cells.len(), "Worksheet cells updated");
        Ok(())
    }

    /// Write the package to `path`, replacing it atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let zip_err =
            |e: zip::result::ZipError| FilingError::Workbook(format!("failed to write {}: {e}", path.display()));

        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in &self.parts {
            zip.start_file(name.as_str(), options).map_err(zip_err)?;
            zip.write_all(data)?;
        }
        let bytes = zip.finish().map_err(zip_err)?.into_inner();

        let tmp = path.with_extension("xlsx.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn xml_error(part: &str) -> impl Fn(quick_xml::Error) -> FilingError + '_ {
    move |e| FilingError::Workbook(format!("malformed {part}: {e}"))
}

fn read_package(bytes: &[u8], what: &str) -> Result<Parts> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| FilingError::Workbook(format!("{what} is not an xlsx package: {e}")))?;
    let mut parts = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| FilingError::Workbook(format!("{what}: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        parts.push((name, data));
    }
    Ok(parts)
}

fn part<'p>(parts: &'p [(String, Vec<u8>)], name: &str) -> Result<&'p [u8]> {
    parts
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, data)| data.as_slice())
        .ok_or_else(|| FilingError::Workbook(format!("package has no {name}")))
}

fn replace_part(parts: &mut [(String, Vec<u8>)], name: &str, data: Vec<u8>) {
    if let Some(slot) = parts.iter_mut().find(|(n, _)| n == name) {
        slot.1 = data;
    }
}

fn sheet_part_for(rels: &[Relationship], sheet: &SheetEntry) -> Result<String> {
    sheet
        .rel_id
        .as_deref()
        .and_then(|id| rels.iter().find(|r| r.id == id))
        .map(|r| part_path(&r.target))
        .ok_or_else(|| FilingError::Workbook(format!("tab {:?} has no worksheet part", sheet.name)))
}

/// Resolve a workbook relationship target to a package path.
fn part_path(target: &str) -> String {
    let joined = match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{target}"),
    };
    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

/// `xl/worksheets/sheet2.xml` -> `xl/worksheets/_rels/sheet2.xml.rels`
fn rels_part_of(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

fn attr(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Copy of `e` with the listed attributes replaced (`Some`) or removed (`None`).
fn with_attributes(e: &BytesStart<'_>, changes: &[(&str, Option<&str>)]) -> BytesStart<'static> {
    let mut out = BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for a in e.attributes().flatten() {
        if !changes.iter().any(|(key, _)| a.key.as_ref() == key.as_bytes()) {
            out.push_attribute(a);
        }
    }
    for (key, value) in changes {
        if let Some(value) = value {
            out.push_attribute((*key, *value));
        }
    }
    out
}

/// `x:` for a prefixed root element, empty otherwise.
fn prefix_of(e: &BytesStart<'_>) -> String {
    e.name()
        .prefix()
        .map(|p| format!("{}:", String::from_utf8_lossy(p.as_ref())))
        .unwrap_or_default()
}

fn list_sheets(xml: &[u8]) -> quick_xml::Result<Vec<SheetEntry>> {
    let mut reader = Reader::from_reader(xml);
    let mut sheets = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                sheets.push(SheetEntry {
                    name: attr(&e, b"name").unwrap_or_default(),
                    rel_id: attr(&e, b"id"),
                });
            }
            Event::Eof => return Ok(sheets),
            _ => {}
        }
    }
}

fn list_relationships(xml: &[u8]) -> quick_xml::Result<Vec<Relationship>> {
    let mut reader = Reader::from_reader(xml);
    let mut rels = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                rels.push(Relationship::from_element(&e));
            }
            Event::Eof => return Ok(rels),
            _ => {}
        }
    }
}

/// Copy `xml`, leaving out every `local` element that `drop` selects.
fn filter_elements<F>(xml: &[u8], local: &[u8], drop: F) -> quick_xml::Result<Vec<u8>>
where
    F: Fn(&BytesStart<'_>) -> bool,
{
    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Vec::new());
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == local && drop(&e) => {
                reader.read_to_end(e.name())?;
            }
            Event::Empty(e) if e.local_name().as_ref() == local && drop(&e) => {}
            Event::Eof => return Ok(writer.into_inner()),
            other => writer.write_event(other)?,
        }
    }
}

enum Edit {
    Keep,
    Skip,
    Replace(BytesStart<'static>),
}

struct WorkbookReducer {
    keep: usize,
    sheet_index: usize,
    calc_pr_seen: bool,
}

impl WorkbookReducer {
    fn edit(&mut self, e: &BytesStart<'_>) -> Edit {
        match e.local_name().as_ref() {
            b"sheet" => {
                let index = self.sheet_index;
                self.sheet_index += 1;
                if index == self.keep { Edit::Keep } else { Edit::Skip }
            }
            // Names scoped to a sheet carry its index.
            b"definedName" => match attr(e, b"localSheetId").and_then(|v| v.parse::<usize>().ok()) {
                None => Edit::Keep,
                Some(id) if id == self.keep => Edit::Replace(with_attributes(e, &[("localSheetId", Some("0"))])),
                Some(_) => Edit::Skip,
            },
            b"workbookView" => Edit::Replace(with_attributes(e, &[("activeTab", None), ("firstSheet", None)])),
            b"calcPr" => {
                self.calc_pr_seen = true;
                Edit::Replace(with_attributes(e, &[("fullCalcOnLoad", Some("1"))]))
            }
            _ => Edit::Keep,
        }
    }

    /// Cached formula results are stale once cells change; ask for a recalculation.
    fn ensure_calc_pr(&mut self, prefix: &str, writer: &mut Writer<Vec<u8>>) -> quick_xml::Result<()> {
        if !self.calc_pr_seen {
            self.calc_pr_seen = true;
            let mut calc = BytesStart::new(format!("{prefix}calcPr"));
            calc.push_attribute(("fullCalcOnLoad", "1"));
            writer.write_event(Event::Empty(calc))?;
        }
        Ok(())
    }
}

/// Drop every sheet but `keep` from `xl/workbook.xml` and renumber what refers to it.
fn reduce_workbook(xml: &[u8], keep: usize) -> quick_xml::Result<Vec<u8>> {
    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Vec::new());
    let mut reducer = WorkbookReducer {
        keep,
        sheet_index: 0,
        calc_pr_seen: false,
    };
    let mut prefix = String::new();
    let mut depth = 0usize;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if depth == 0 {
                    prefix = prefix_of(&e);
                }
                if depth == 1 && AFTER_CALC_PR.contains(&e.local_name().as_ref()) {
                    reducer.ensure_calc_pr(&prefix, &mut writer)?;
                }
                match reducer.edit(&e) {
                    Edit::Skip => {
                        reader.read_to_end(e.name())?;
                    }
                    Edit::Keep => {
                        writer.write_event(Event::Start(e))?;
                        depth += 1;
                    }
                    Edit::Replace(replacement) => {
                        writer.write_event(Event::Start(replacement))?;
                        depth += 1;
                    }
                }
            }
            Event::Empty(e) => {
                if depth == 1 && AFTER_CALC_PR.contains(&e.local_name().as_ref()) {
                    reducer.ensure_calc_pr(&prefix, &mut writer)?;
                }
                match reducer.edit(&e) {
                    Edit::Skip => {}
                    Edit::Keep => writer.write_event(Event::Empty(e))?,
                    Edit::Replace(replacement) => writer.write_event(Event::Empty(replacement))?,
                }
            }
            Event::End(e) => {
                if depth == 1 {
                    reducer.ensure_calc_pr(&prefix, &mut writer)?;
                }
                depth = depth.saturating_sub(1);
                writer.write_event(Event::End(e))?;
            }
            Event::Eof => return Ok(writer.into_inner()),
            other => writer.write_event(other)?,
        }
    }
}

/// Remove and return the entries keyed below `key`.
fn take_before<K: Ord, V>(map: &mut BTreeMap<K, V>, key: &K) -> BTreeMap<K, V> {
    let later = map.split_off(key);
    std::mem::replace(map, later)
}

struct SheetWriter {
    writer: Writer<Vec<u8>>,
    prefix: String,
}

impl SheetWriter {
    fn tag(&self, local: &str) -> String {
        format!("{}{local}", self.prefix)
    }

    fn event(&mut self, event: Event<'_>) -> quick_xml::Result<()> {
        self.writer.write_event(event)
    }

    /// Plain decimals become numeric cells, everything else an inline string.
    fn cell(&mut self, row: u32, col: u16, style: Option<&str>, value: &str) -> quick_xml::Result<()> {
        let tag = self.tag("c");
        let reference = format!("{}{row}", column_letters(col));
        let mut cell = BytesStart::new(tag.as_str());
        cell.push_attribute(("r", reference.as_str()));
        if let Some(style) = style {
            cell.push_attribute(("s", style));
        }
        if value.is_empty() {
            return self.event(Event::Empty(cell));
        }

        if is_plain_number(value) {
            self.event(Event::Start(cell))?;
            self.text_element("v", &[], value)?;
        } else {
            cell.push_attribute(("t", "inlineStr"));
            self.event(Event::Start(cell))?;
            let is = self.tag("is");
            self.event(Event::Start(BytesStart::new(is.as_str())))?;
            let space: &[(&str, &str)] = if value.trim() != value { &[("xml:space", "preserve")] } else { &[] };
            self.text_element("t", space, value)?;
            self.event(Event::End(BytesEnd::new(is)))?;
        }
        self.event(Event::End(BytesEnd::new(tag)))
    }

    fn text_element(&mut self, local: &str, attrs: &[(&str, &str)], text: &str) -> quick_xml::Result<()> {
        let tag = self.tag(local);
        let mut start = BytesStart::new(tag.as_str());
        for attr in attrs {
            start.push_attribute(*attr);
        }
        self.event(Event::Start(start))?;
        self.event(Event::Text(BytesText::new(text)))?;
        self.event(Event::End(BytesEnd::new(tag)))
    }

    fn cells(&mut self, row: u32, cells: BTreeMap<u16, String>) -> quick_xml::Result<()> {
        for (col, value) in cells {
            self.cell(row, col, None, &value)?;
        }
        Ok(())
    }

    fn row(&mut self, row: u32, cells: BTreeMap<u16, String>) -> quick_xml::Result<()> {
        let tag = self.tag("row");
        let mut start = BytesStart::new(tag.as_str());
        start.push_attribute(("r", row.to_string().as_str()));
        self.event(Event::Start(start))?;
        self.cells(row, cells)?;
        self.event(Event::End(BytesEnd::new(tag)))
    }

    fn rows(&mut self, rows: PendingCells) -> quick_xml::Result<()> {
        for (row, cells) in rows {
            self.row(row, cells)?;
        }
        Ok(())
    }
}

/// Column of a `<c>` element: its `r` reference, else the one after `previous`.
fn cell_column(e: &BytesStart<'_>, previous: Option<u16>) -> u16 {
    attr(e, b"r")
        .and_then(|r| r.parse::<CellRef>().ok())
        .map(|cell| cell.indices().1)
        .unwrap_or_else(|| previous.map_or(0, |c| c + 1))
}

#[derive(Clone, Copy)]
enum SheetTag {
    SheetData,
    Row,
    Cell,
    Other,
}

fn sheet_tag(e: &BytesStart<'_>) -> SheetTag {
    match e.local_name().as_ref() {
        b"sheetData" => SheetTag::SheetData,
        b"row" => SheetTag::Row,
        b"c" => SheetTag::Cell,
        _ => SheetTag::Other,
    }
}

fn row_number(e: &BytesStart<'_>, previous: u32) -> u32 {
    attr(e, b"r").and_then(|r| r.parse().ok()).unwrap_or(previous + 1)
}

/// Stream a worksheet, replacing or inserting the pending cells in row/column order.
/// Untouched cells, formulas and everything outside `sheetData` pass through as is.
fn patch_sheet(xml: &[u8], mut pending: PendingCells) -> quick_xml::Result<Vec<u8>> {
    let mut reader = Reader::from_reader(xml);
    let mut out = SheetWriter {
        writer: Writer::new(Vec::new()),
        prefix: String::new(),
    };
    let mut root_seen = false;
    let mut in_data = false;
    // Row being patched and its remaining cells.
    let mut open_row: Option<(u32, BTreeMap<u16, String>)> = None;
    let mut last_row = 0u32;
    let mut last_col: Option<u16> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if !root_seen {
                    root_seen = true;
                    out.prefix = prefix_of(&e);
                }
                match sheet_tag(&e) {
                    SheetTag::SheetData => {
                        in_data = true;
                        out.event(Event::Start(e))?;
                    }
                    SheetTag::Row if in_data => {
                        let row = row_number(&e, last_row);
                        last_row = row;
                        last_col = None;
                        out.rows(take_before(&mut pending, &row))?;
                        match pending.remove(&row) {
                            Some(cells) => {
                                out.event(Event::Start(with_attributes(&e, &[("spans", None)])))?;
                                open_row = Some((row, cells));
                            }
                            None => out.event(Event::Start(e))?,
                        }
                    }
                    SheetTag::Cell => match open_row.as_mut() {
                        Some((row, cells)) => {
                            let col = cell_column(&e, last_col);
                            last_col = Some(col);
                            out.cells(*row, take_before(cells, &col))?;
                            match cells.remove(&col) {
                                Some(value) => {
                                    out.cell(*row, col, attr(&e, b"s").as_deref(), &value)?;
                                    reader.read_to_end(e.name())?;
                                }
                                None => out.event(Event::Start(e))?,
                            }
                        }
                        None => out.event(Event::Start(e))?,
                    },
                    _ => out.event(Event::Start(e))?,
                }
            }
            Event::Empty(e) => match sheet_tag(&e) {
                SheetTag::SheetData if !pending.is_empty() => {
                    out.event(Event::Start(e.clone()))?;
                    out.rows(std::mem::take(&mut pending))?;
                    out.event(Event::End(e.to_end()))?;
                }
                SheetTag::Row if in_data => {
                    let row = row_number(&e, last_row);
                    last_row = row;
                    out.rows(take_before(&mut pending, &row))?;
                    match pending.remove(&row) {
                        Some(cells) => {
                            let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                            out.event(Event::Start(with_attributes(&e, &[("spans", None)])))?;
                            out.cells(row, cells)?;
                            out.event(Event::End(BytesEnd::new(tag)))?;
                        }
                        None => out.event(Event::Empty(e))?,
                    }
                }
                SheetTag::Cell => match open_row.as_mut() {
                    Some((row, cells)) => {
                        let col = cell_column(&e, last_col);
                        last_col = Some(col);
                        out.cells(*row, take_before(cells, &col))?;
                        match cells.remove(&col) {
                            Some(value) => out.cell(*row, col, attr(&e, b"s").as_deref(), &value)?,
                            None => out.event(Event::Empty(e))?,
                        }
                    }
                    None => out.event(Event::Empty(e))?,
                },
                _ => out.event(Event::Empty(e))?,
            },
            Event::End(e) => {
                match e.local_name().as_ref() {
                    b"row" if in_data => {
                        if let Some((row, cells)) = open_row.take() {
                            out.cells(row, cells)?;
                        }
                    }
                    b"sheetData" => {
                        in_data = false;
                        out.rows(std::mem::take(&mut pending))?;
                    }
                    _ => {}
                }
                out.event(Event::End(e))?;
            }
            Event::Eof => return Ok(out.writer.into_inner()),
            other => out.event(other)?,
        }
    }
}
