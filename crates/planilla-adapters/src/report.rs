//! Spreadsheet decoding and reshaping of payroll reports.
//!
//! The portal's workbooks have no machine-readable schema; their structure is
//! positional. [`ReportLayout::V1`] pins the positions this crate relies on so
//! that a layout change fails loudly instead of producing shifted data.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::LazyLock;

use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use planilla_core::{parse_portal_timestamp, NormalizedRecord, NormalizedReport, WorkItem};
use regex::Regex;

use crate::{ParseError, ReportPayload};

pub const FALLBACK_ARCHIVO: &str = "reporte_contraloria";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

static ARCHIVO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"filename="(.*?)\.xlsx""#).expect("filename pattern is valid")
});

static SHEET_STAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".*?:\s+(\d{2}/\d{2}/\d{4}\s+\d{1,2}:\d{1,2}:\d{1,2}\s+\w{2})")
        .expect("sheet stamp pattern is valid")
});

/// Cells of one worksheet, row-major, with column 0 being sheet column A.
pub type SheetGrid = Vec<Vec<Data>>;

/// Zero-based positions in the sheet grid. Blank rows count; row 0 is the
/// banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportLayout {
    pub header_row: usize,
    pub first_data_row: usize,
    /// (row, column) of the "updated as of" text in the first sheet.
    pub updated_at_cell: (usize, usize),
}

impl ReportLayout {
    pub const V1: ReportLayout = ReportLayout {
        header_row: 4,
        first_data_row: 5,
        updated_at_cell: (2, 4),
    };
}

impl Default for ReportLayout {
    fn default() -> Self {
        Self::V1
    }
}

pub fn archivo_from_content_disposition(header: Option<&str>) -> String {
    header
        .and_then(|h| ARCHIVO_RE.captures(h))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_ARCHIVO.to_string())
}

/// Canonical column key: trimmed, lowercase, spaces as underscores, with the
/// accented `cédula` unified to `cedula`.
pub fn normalize_column_label(label: &str) -> String {
    let key = label
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    // Both the precomposed and the combining-accent spellings occur.
    key.replace("c\u{e9}dula", "cedula")
        .replace("ce\u{301}dula", "cedula")
}

pub fn decode_workbook(bytes: &[u8]) -> Result<Vec<(String, SheetGrid)>, ParseError> {
    if !bytes.starts_with(ZIP_MAGIC) {
        let preview: String = String::from_utf8_lossy(&bytes[..bytes.len().min(64)])
            .chars()
            .filter(|c| !c.is_control())
            .collect();
        return Err(ParseError::NotASpreadsheet { preview });
    }

    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))
        .map_err(|err: calamine::XlsxError| ParseError::Workbook(err.to_string()))?;

    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|err| ParseError::Workbook(format!("sheet {name:?}: {err}")))?;
        let (top_pad, left_pad) = range
            .start()
            .map(|(row, col)| (row as usize, col as usize))
            .unwrap_or((0, 0));
        let mut grid: SheetGrid = vec![Vec::new(); top_pad];
        grid.extend(range.rows().map(|row| {
            let mut cells = vec![Data::Empty; left_pad];
            cells.extend(row.iter().cloned());
            cells
        }));
        sheets.push((name, grid));
    }
    Ok(sheets)
}

fn is_blank(cell: &Data) -> bool {
    match cell {
        Data::Empty => true,
        Data::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn cell_text(cell: &Data) -> Option<String> {
    let text = match cell {
        Data::Empty => return None,
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::Error(e) => e.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

enum NumberCell {
    Value(f64),
    Missing,
    Invalid(String),
}

fn cell_number(cell: &Data) -> NumberCell {
    let value = match cell {
        Data::Float(f) => *f,
        Data::Int(i) => *i as f64,
        Data::String(s) if s.trim().is_empty() => return NumberCell::Missing,
        Data::String(s) => match s.trim().parse::<f64>() {
            Ok(v) => v,
            Err(_) => return NumberCell::Invalid(s.trim().to_string()),
        },
        Data::Empty => return NumberCell::Missing,
        other => return NumberCell::Invalid(cell_text(other).unwrap_or_default()),
    };
    if value.is_finite() {
        NumberCell::Value(value)
    } else {
        NumberCell::Invalid(value.to_string())
    }
}

fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(TimeDelta::try_days(serial.floor() as i64)?)
}

fn parse_start_date(cell: &Data) -> Result<Option<NaiveDate>, String> {
    match cell {
        Data::Empty => Ok(None),
        Data::String(s) if s.trim().is_empty() => Ok(None),
        Data::String(s) => NaiveDate::parse_from_str(s.trim(), "%d/%m/%Y")
            .map(Some)
            .map_err(|_| s.trim().to_string()),
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64())
            .map(Some)
            .ok_or_else(|| dt.as_f64().to_string()),
        Data::Float(f) => excel_serial_to_date(*f)
            .map(Some)
            .ok_or_else(|| f.to_string()),
        Data::DateTimeIso(s) => s
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .map(Some)
            .ok_or_else(|| s.clone()),
        other => Err(cell_text(other).unwrap_or_default()),
    }
}

fn is_blank_row(row: &[Data]) -> bool {
    row.iter().all(is_blank)
}

fn grid_cell(grid: &SheetGrid, (row, col): (usize, usize)) -> Option<&Data> {
    grid.get(row).and_then(|r| r.get(col))
}

struct Columns {
    cedula: usize,
    nombre: usize,
    apellido: Option<usize>,
    cargo: usize,
    salario: usize,
    gasto: usize,
    estado: Option<usize>,
    fecha_de_inicio: usize,
}

impl Columns {
    fn resolve(sheet: &str, header: &[Data]) -> Result<Self, ParseError> {
        let mut index = HashMap::new();
        for (position, cell) in header.iter().enumerate() {
            if let Some(label) = cell_text(cell) {
                index.entry(normalize_column_label(&label)).or_insert(position);
            }
        }

        let required = |column: &'static str| {
            index
                .get(column)
                .copied()
                .ok_or_else(|| ParseError::MissingColumn {
                    sheet: sheet.to_string(),
                    column,
                })
        };

        Ok(Self {
            cedula: required("cedula")?,
            nombre: required("nombre")?,
            apellido: index.get("apellido").copied(),
            cargo: required("cargo")?,
            salario: required("salario")?,
            gasto: required("gasto")?,
            estado: index.get("estado").copied(),
            fecha_de_inicio: required("fecha_de_inicio")?,
        })
    }
}

fn sheet_stamp(grid: &SheetGrid, layout: &ReportLayout) -> Result<NaiveDateTime, ParseError> {
    let (row, column) = layout.updated_at_cell;
    let text = grid_cell(grid, layout.updated_at_cell)
        .and_then(cell_text)
        .ok_or(ParseError::UpdatedAtMissing { row, column })?;
    SHEET_STAMP_RE
        .captures(&text)
        .and_then(|c| c.get(1))
        .and_then(|m| parse_portal_timestamp(m.as_str()))
        .ok_or(ParseError::UpdatedAtInvalid(text))
}

/// Reshape decoded sheets into one record set.
pub fn normalize_sheets(
    sheets: &[(String, SheetGrid)],
    layout: &ReportLayout,
    item: &WorkItem,
    archivo: &str,
    queried_at: DateTime<Utc>,
) -> Result<NormalizedReport, ParseError> {
    let populated: Vec<(&str, &SheetGrid)> = sheets
        .iter()
        .filter(|(_, grid)| !grid.iter().all(|row| is_blank_row(row)))
        .map(|(name, grid)| (name.as_str(), grid))
        .collect();

    let Some((_, first)) = populated.first() else {
        return Err(ParseError::EmptyWorkbook);
    };
    let fecha_actualizacion = sheet_stamp(first, layout)?;

    let mut records = Vec::new();
    for (sheet, grid) in &populated {
        let Some(header) = grid.get(layout.header_row) else {
            return Err(ParseError::SheetTooShort {
                sheet: sheet.to_string(),
                rows: grid.len(),
                needed: layout.header_row + 1,
            });
        };
        let columns = Columns::resolve(sheet, header)?;

        for (index, row) in grid.iter().enumerate().skip(layout.first_data_row) {
            if is_blank_row(row) {
                continue;
            }
            // 1-based, as spreadsheet software numbers rows
            let row_no = index + 1;
            let text = |col: usize| row.get(col).and_then(cell_text);
            let number = |col: usize, column: &'static str| {
                match row.get(col).map(cell_number).unwrap_or(NumberCell::Missing) {
                    NumberCell::Value(v) => Ok(v),
                    NumberCell::Missing => Err(ParseError::MissingValue {
                        sheet: sheet.to_string(),
                        row: row_no,
                        column,
                    }),
                    NumberCell::Invalid(value) => Err(ParseError::NonNumeric {
                        sheet: sheet.to_string(),
                        row: row_no,
                        column,
                        value,
                    }),
                }
            };

            let fecha_de_inicio = match row.get(columns.fecha_de_inicio) {
                Some(cell) => {
                    parse_start_date(cell).map_err(|value| ParseError::InvalidStartDate {
                        sheet: sheet.to_string(),
                        row: row_no,
                        value,
                    })?
                }
                None => None,
            };

            records.push(NormalizedRecord {
                cedula: text(columns.cedula).unwrap_or_default(),
                nombre: text(columns.nombre).unwrap_or_default(),
                apellido: columns.apellido.and_then(text),
                cargo: text(columns.cargo).unwrap_or_default(),
                salario: number(columns.salario, "salario")?,
                gasto: number(columns.gasto, "gasto")?,
                estado: columns
                    .estado
                    .and_then(text)
                    .unwrap_or_else(|| item.status.label().to_string()),
                fecha_de_inicio,
                fecha_actualizacion,
                fecha_consulta: queried_at,
                archivo: archivo.to_string(),
                institucion: item.institution.name().to_string(),
            });
        }
    }

    Ok(NormalizedReport {
        archivo: archivo.to_string(),
        fecha_consulta: queried_at,
        fecha_actualizacion,
        records,
    })
}

/// Decode and normalize one downloaded report.
pub fn normalize_report(
    payload: &ReportPayload,
    item: &WorkItem,
    queried_at: DateTime<Utc>,
    layout: &ReportLayout,
) -> Result<NormalizedReport, ParseError> {
    let archivo = archivo_from_content_disposition(payload.content_disposition.as_deref());
    let sheets = decode_workbook(&payload.body)?;
    normalize_sheets(&sheets, layout, item, &archivo, queried_at)
}
