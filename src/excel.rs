use calamine::{open_workbook_from_rs, Data, DataType, Range, Reader, Xlsx};
use chrono::Timelike;
use edit_xlsx::{FormatColor, Write};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;
use regex::Regex;
use rust_xlsxwriter::{Color, Format, Workbook, Worksheet, XlsxError};
use std::io::{Cursor, Read, Write as IoWrite};
use std::path::Path;
use std::sync::OnceLock;
use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::address::{split_sheet_prefix, CellAddress, CellRange};
use crate::error::{FormFillError, FormFillResult};
use crate::types::{FillDirective, MasterData, SheetCell, SkippedWrite};

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Font colour of AI-written cells.
const HIGHLIGHT_RGB: (u8, u8, u8) = (0x1D, 0x4E, 0xD8);

/// Declared ranges larger than this are ignored in favour of the cells that
/// hold data; a data range larger than this is refused.
const MAX_INDEXED_CELLS: u64 = 200_000;

/// Reject anything that is not a plausible .xlsx upload before touching it.
pub fn validate_xlsx_upload(file_name: &str, bytes: &[u8], max_bytes: usize) -> FormFillResult<()> {
    let is_xlsx = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("xlsx"))
        .unwrap_or(false);
    if !is_xlsx {
        return Err(FormFillError::UnsupportedFile(
            "only .xlsx forms can be filled".to_string(),
        ));
    }
    if bytes.is_empty() {
        return Err(FormFillError::UnsupportedFile("the file is empty".to_string()));
    }
    if bytes.len() > max_bytes {
        return Err(FormFillError::UnsupportedFile(format!(
            "file too large (max {}MB)",
            max_bytes / (1024 * 1024)
        )));
    }
    if bytes.len() < ZIP_MAGIC.len() || bytes[..ZIP_MAGIC.len()] != ZIP_MAGIC {
        return Err(FormFillError::UnsupportedFile(
            "not a valid Excel file (.xlsx)".to_string(),
        ));
    }
    Ok(())
}

/// Geometry of the first worksheet: its name, used range and merged regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLayout {
    pub name: String,
    pub used_range: Option<CellRange>,
    pub merged: Vec<CellRange>,
}

impl SheetLayout {
    /// Resolve a raw reference to the one cell a write should land in.
    /// Cells inside a merged region resolve to the region's anchor. A sheet
    /// prefix must name this sheet.
    pub fn resolve(&self, raw: &str) -> Result<CellAddress, String> {
        if let (Some(sheet), _) = split_sheet_prefix(raw) {
            if !sheet.eq_ignore_ascii_case(&self.name) {
                return Err(format!(
                    "'{}' points at sheet '{}', not '{}'",
                    raw.trim(),
                    sheet,
                    self.name
                ));
            }
        }
        let addr = CellAddress::parse(raw)
            .ok_or_else(|| format!("'{}' is not a cell reference", raw.trim()))?;
        let addr = self
            .merged
            .iter()
            .find(|m| m.contains(addr))
            .map(|m| m.start)
            .unwrap_or(addr);
        match &self.used_range {
            Some(range) if range.contains(addr) => Ok(addr),
            _ => Err(format!("{} is outside the form's used range", addr)),
        }
    }
}

struct LoadedSheet {
    layout: SheetLayout,
    values: Range<Data>,
}

fn load_sheet(bytes: &[u8]) -> FormFillResult<LoadedSheet> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs::<Xlsx<_>, _>(Cursor::new(bytes))
        .map_err(|e| FormFillError::UnreadableFile(e.to_string()))?;
    let name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(FormFillError::NoWorksheet)?;
    let values = workbook
        .worksheet_range(&name)
        .map_err(|e| FormFillError::UnreadableFile(format!("Sheet '{}': {}", name, e)))?;

    let (dimension, merged) = match read_sheet_geometry(bytes) {
        Ok(geometry) => geometry,
        Err(e) => {
            log::warn!("[excel] Could not read sheet geometry, using cell data only: {}", e);
            (None, Vec::new())
        }
    };
    let data_range = match (values.start(), values.end()) {
        (Some((r0, c0)), Some((r1, c1))) => Some(CellRange::new(
            CellAddress::new(r0, c0),
            CellAddress::new(r1, c1),
        )),
        _ => None,
    };
    // A blank sheet still declares <dimension ref="A1"/>.
    let dimension = dimension.filter(|d| !(d.is_single_cell() && data_range.is_none()));
    let mut used_range = match (dimension, data_range) {
        (Some(d), Some(r)) => Some(d.union(&r)),
        (d, r) => d.or(r),
    };
    if used_range.map(|r| r.cell_count() > MAX_INDEXED_CELLS).unwrap_or(false) {
        log::warn!(
            "[excel] Declared range {:?} of '{}' is too large, falling back to data range",
            used_range.map(|r| r.to_string()),
            name
        );
        used_range = data_range;
    }
    if let Some(range) = used_range.filter(|r| r.cell_count() > MAX_INDEXED_CELLS) {
        return Err(FormFillError::UnsupportedFile(format!(
            "form too large ({} spans {} cells, max {})",
            range,
            range.cell_count(),
            MAX_INDEXED_CELLS
        )));
    }

    Ok(LoadedSheet {
        layout: SheetLayout {
            name,
            used_range,
            merged,
        },
        values,
    })
}

/// Layout of the first worksheet.
pub fn read_layout(bytes: &[u8]) -> FormFillResult<SheetLayout> {
    load_sheet(bytes).map(|s| s.layout)
}

/// Flatten the first worksheet into row-major `(address, text)` pairs covering
/// the whole used range, empty cells included.
pub fn index_sheet(bytes: &[u8]) -> FormFillResult<Vec<SheetCell>> {
    read_indexed(bytes).map(|(_, cells)| cells)
}

/// Layout and cell listing of the first worksheet from one read.
pub fn read_indexed(bytes: &[u8]) -> FormFillResult<(SheetLayout, Vec<SheetCell>)> {
    let sheet = load_sheet(bytes)?;
    let Some(range) = sheet.layout.used_range else {
        return Ok((sheet.layout, Vec::new()));
    };
    let cells: Vec<SheetCell> = range
        .cells()
        .map(|address| SheetCell {
            address,
            text: sheet
                .values
                .get_value((address.row, address.col))
                .map(display_text)
                .unwrap_or_default(),
        })
        .collect();
    log::debug!(
        "[excel] Indexed {} cells ({}) of '{}'",
        cells.len(),
        range,
        sheet.layout.name
    );
    Ok((sheet.layout, cells))
}

/// Displayed text of a cell: cached formula results, never the formula.
fn display_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::Error(e) => e.to_string(),
        Data::DateTime(_) => cell
            .as_datetime()
            .map(|dt| {
                if dt.hour() == 0 && dt.minute() == 0 && dt.second() == 0 {
                    dt.format("%Y-%m-%d").to_string()
                } else {
                    dt.format("%Y-%m-%d %H:%M:%S").to_string()
                }
            })
            .or_else(|| cell.as_string())
            .unwrap_or_default(),
        _ => cell.as_string().unwrap_or_default(),
    }
}

fn read_zip_text<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<String, String> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| format!("{}: {}", name, e))?;
    let mut s = String::new();
    entry
        .read_to_string(&mut s)
        .map_err(|e| format!("Read {}: {}", name, e))?;
    Ok(s)
}

fn attr_value(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

/// Relationship id of the first `<sheet>` in workbook.xml.
fn first_sheet_rel_id(xml: &str) -> Result<Option<String>, String> {
    let mut reader = XmlReader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                return Ok(attr_value(&e, b"id"));
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(format!("workbook.xml: {}", e)),
            _ => {}
        }
    }
}

fn relationship_target(xml: &str, rel_id: &str) -> Result<Option<String>, String> {
    let mut reader = XmlReader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                if attr_value(&e, b"Id").as_deref() == Some(rel_id) {
                    return Ok(attr_value(&e, b"Target"));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(format!("workbook.xml.rels: {}", e)),
            _ => {}
        }
    }
}

/// `<dimension ref>` and `<mergeCell ref>` entries of a worksheet part.
fn scan_sheet_xml(xml: &str) -> Result<(Option<CellRange>, Vec<CellRange>), String> {
    let mut reader = XmlReader::from_str(xml);
    let mut dimension = None;
    let mut merged = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"dimension" => {
                    dimension = attr_value(&e, b"ref").and_then(|r| CellRange::parse(&r));
                }
                b"mergeCell" => {
                    if let Some(range) = attr_value(&e, b"ref").and_then(|r| CellRange::parse(&r)) {
                        merged.push(range);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("worksheet xml: {}", e)),
            _ => {}
        }
    }
    Ok((dimension, merged))
}

fn read_sheet_geometry(bytes: &[u8]) -> Result<(Option<CellRange>, Vec<CellRange>), String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| format!("Invalid zip: {}", e))?;
    let workbook_xml = read_zip_text(&mut archive, "xl/workbook.xml")?;
    let rel_id = first_sheet_rel_id(&workbook_xml)?.ok_or("workbook.xml lists no sheets")?;
    let rels_xml = read_zip_text(&mut archive, "xl/_rels/workbook.xml.rels")?;
    let target = relationship_target(&rels_xml, &rel_id)?
        .ok_or_else(|| format!("Relationship {} not found", rel_id))?;
    let part = match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target),
    };
    let sheet_xml = read_zip_text(&mut archive, &part)?;
    scan_sheet_xml(&sheet_xml)
}

/// Result of one batch of cell writes.
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    pub bytes: Vec<u8>,
    pub written: Vec<CellAddress>,
    /// Written cells that held text before the write.
    pub overwritten: Vec<CellAddress>,
    pub skipped: Vec<SkippedWrite>,
}

/// Cell-write primitive shared by the form filler and the correction engine.
/// Every directive that resolves is written as a highlighted string; the rest
/// are logged and reported as skipped. Only an unreadable or unsaveable
/// workbook fails the whole batch.
pub fn write_cells(bytes: &[u8], directives: &[FillDirective]) -> FormFillResult<WriteReport> {
    let sheet = load_sheet(bytes)?;
    let mut report = WriteReport::default();
    let mut resolved: Vec<(CellAddress, String)> = Vec::new();

    for directive in directives {
        match sheet.layout.resolve(&directive.target_cell) {
            Ok(addr) => {
                let existing = sheet
                    .values
                    .get_value((addr.row, addr.col))
                    .map(display_text)
                    .unwrap_or_default();
                if !existing.trim().is_empty() {
                    report.overwritten.push(addr);
                }
                resolved.push((addr, sanitize_cell(&directive.value)));
            }
            Err(reason) => {
                log::warn!(
                    "[excel] Skipping write to {:?}: {}",
                    directive.target_cell,
                    reason
                );
                report.skipped.push(SkippedWrite {
                    target_cell: directive.target_cell.clone(),
                    reason,
                });
            }
        }
    }

    if resolved.is_empty() {
        report.bytes = bytes.to_vec();
        return Ok(report);
    }

    // edit_xlsx only opens from a path.
    let dir = tempfile::tempdir()?;
    let source = dir.path().join("form.xlsx");
    std::fs::write(&source, bytes)?;

    let mut workbook = edit_xlsx::Workbook::from_path(&source)
        .map_err(|e| FormFillError::UnreadableFile(e.to_string()))?;
    let worksheet = workbook
        .get_worksheet_mut_by_name(&sheet.layout.name)
        .map_err(|e| FormFillError::Write(format!("Sheet not found: {}", e)))?;

    let format = highlight_format();
    for (addr, value) in resolved {
        let cell_ref = addr.to_string();
        match worksheet.write_string_with_format(cell_ref.as_str(), value, &format) {
            Ok(_) => report.written.push(addr),
            Err(e) => {
                log::warn!("[excel] Write to {} failed: {}", cell_ref, e);
                report.skipped.push(SkippedWrite {
                    target_cell: cell_ref,
                    reason: e.to_string(),
                });
            }
        }
    }

    let output = dir.path().join("filled.xlsx");
    workbook
        .save_as(&output)
        .map_err(|e| FormFillError::Write(e.to_string()))?;
    let saved = std::fs::read(&output)?;
    report.bytes = strip_drawings(&saved)?;
    Ok(report)
}

/// Bold coloured font; value and type of the cell are untouched.
fn highlight_format() -> edit_xlsx::Format {
    let (r, g, b) = HIGHLIGHT_RGB;
    edit_xlsx::Format::default()
        .set_color(FormatColor::RGB(r, g, b))
        .set_bold()
}

fn is_drawing_part(name: &str) -> bool {
    name.starts_with("xl/drawings/") || name.starts_with("xl/media/")
}

fn rel_drawing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<Relationship[^>]*drawing[^>]*/>"#).expect("rel drawing regex"))
}

fn ct_drawing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<Override\s+PartName="/xl/(drawings|media)/[^"]*"[^>]*/>"#).expect("ct drawing regex")
    })
}

fn sheet_drawing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<(drawing|legacyDrawing)\s[^>]*/>"#).expect("sheet drawing regex"))
}

/// Strip drawing and image parts so spreadsheet apps don't report
/// "Repairs to ... Removed Part: Drawing shape" after a rewrite.
fn strip_drawings(bytes: &[u8]) -> FormFillResult<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| FormFillError::Write(format!("Invalid zip: {}", e)))?;
    if !archive.file_names().any(is_drawing_part) {
        return Ok(bytes.to_vec());
    }

    let mut zip_writer = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| FormFillError::Write(format!("Entry {}: {}", i, e)))?;
        let name = entry.name().replace('\\', "/");
        if is_drawing_part(&name) {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;

        let data = if name == "[Content_Types].xml" {
            let s = String::from_utf8_lossy(&data);
            ct_drawing_re().replace_all(&s, "").into_owned().into_bytes()
        } else if name.contains("worksheets/_rels/") && name.ends_with(".rels") {
            let s = String::from_utf8_lossy(&data);
            rel_drawing_re().replace_all(&s, "").into_owned().into_bytes()
        } else if name.starts_with("xl/worksheets/") && name.ends_with(".xml") {
            let s = String::from_utf8_lossy(&data);
            sheet_drawing_re().replace_all(&s, "").into_owned().into_bytes()
        } else {
            data
        };
        zip_writer
            .start_file(name.as_str(), opts)
            .map_err(|e| FormFillError::Write(e.to_string()))?;
        zip_writer.write_all(&data)?;
    }
    let cursor = zip_writer
        .finish()
        .map_err(|e| FormFillError::Write(e.to_string()))?;
    Ok(cursor.into_inner())
}

/// Remove characters XML 1.0 cannot carry (control chars except tab,
/// newline, CR). Markup characters are escaped by the writers.
pub fn sanitize_cell(s: &str) -> String {
    s.chars()
        .filter(|&c| {
            let u = c as u32;
            matches!(c, '\t' | '\n' | '\r') || !(u < 0x20 || u == 0x7F || u == 0xFFFE || u == 0xFFFF)
        })
        .collect()
}

/// Estimate column width from text length (char count × 1.2, clamped 10–60).
fn estimate_text_width(text: &str) -> f64 {
    let w = text.chars().count() as f64 * 1.2;
    w.clamp(10.0, 60.0)
}

fn write_text_cell_safe(
    worksheet: &mut Worksheet,
    row: u32,
    col: u16,
    text: &str,
    format: &Format,
) -> Result<(), XlsxError> {
    let cleaned = sanitize_cell(text);
    worksheet
        .write_string_with_format(row, col, &cleaned, format)
        .map(|_| ())
}

/// Two-column Key/Value workbook of a user's master data, for download.
pub fn export_master_data(data: &MasterData) -> FormFillResult<Vec<u8>> {
    let xlsx_err = |e: XlsxError| FormFillError::Write(e.to_string());

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Master Data").map_err(xlsx_err)?;

    let header_format = Format::new()
        .set_bold()
        .set_background_color(Color::RGB(0x2563EB))
        .set_font_color(Color::RGB(0xFFFFFF));
    let text_format = Format::new().set_text_wrap();

    let mut key_width = estimate_text_width("Key");
    let mut value_width = estimate_text_width("Value");
    write_text_cell_safe(worksheet, 0, 0, "Key", &header_format).map_err(xlsx_err)?;
    write_text_cell_safe(worksheet, 0, 1, "Value", &header_format).map_err(xlsx_err)?;

    for (i, (key, value)) in data.iter().enumerate() {
        let row = (i + 1) as u32;
        write_text_cell_safe(worksheet, row, 0, key, &text_format).map_err(xlsx_err)?;
        write_text_cell_safe(worksheet, row, 1, value, &text_format).map_err(xlsx_err)?;
        key_width = key_width.max(estimate_text_width(key));
        value_width = value_width.max(estimate_text_width(value));
    }

    worksheet.set_column_width(0, key_width).map_err(xlsx_err)?;
    worksheet.set_column_width(1, value_width).map_err(xlsx_err)?;
    let _ = worksheet.set_freeze_panes(1, 0);
    workbook.save_to_buffer().map_err(xlsx_err)
}
