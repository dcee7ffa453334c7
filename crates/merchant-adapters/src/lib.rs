//! Tabular source readers and the catalog record parser.

use std::io::Cursor;
use std::str::FromStr;

use calamine::{Reader, Xlsx};
use merchant_core::OfferDraft;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_SHEET: &str = "data";

/// Container-level failure; terminal for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("cannot open source file: {0}")]
    Open(String),
    #[error("cannot read sheet {sheet:?}: {reason}")]
    Sheet { sheet: String, reason: String },
}

/// Opens raw bytes as a spreadsheet-like document.
pub trait TabularReader: Send + Sync {
    fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn TabularDocument>, SourceError>;
}

pub trait TabularDocument {
    /// Every row of `sheet`, cells rendered as strings.
    fn rows(&mut self, sheet: &str) -> Result<Vec<Vec<String>>, SourceError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    #[default]
    Xlsx,
    Csv,
}

impl SourceFormat {
    pub fn reader(self) -> Box<dyn TabularReader> {
        match self {
            SourceFormat::Xlsx => Box::new(XlsxReader),
            SourceFormat::Csv => Box::new(CsvReader),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            SourceFormat::Xlsx => "xlsx",
            SourceFormat::Csv => "csv",
        }
    }
}

impl FromStr for SourceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xlsx" => Ok(SourceFormat::Xlsx),
            "csv" => Ok(SourceFormat::Csv),
            other => Err(format!("unsupported source format {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XlsxReader;

struct XlsxDocument {
    workbook: Xlsx<Cursor<Vec<u8>>>,
}

impl TabularReader for XlsxReader {
    fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn TabularDocument>, SourceError> {
        let workbook: Xlsx<_> =
            Xlsx::new(Cursor::new(bytes)).map_err(|err| SourceError::Open(err.to_string()))?;
        Ok(Box::new(XlsxDocument { workbook }))
    }
}

impl TabularDocument for XlsxDocument {
    fn rows(&mut self, sheet: &str) -> Result<Vec<Vec<String>>, SourceError> {
        let range = self
            .workbook
            .worksheet_range(sheet)
            .map_err(|err| SourceError::Sheet {
                sheet: sheet.to_string(),
                reason: err.to_string(),
            })?;
        // Ranges begin at the first used cell; pad so column 0 is always column A.
        let lead_cols = range.start().map(|(_, col)| col as usize).unwrap_or(0);
        Ok(range
            .rows()
            .map(|row| {
                std::iter::repeat(String::new())
                    .take(lead_cols)
                    .chain(row.iter().map(|cell| cell.to_string()))
                    .collect()
            })
            .collect())
    }
}

/// Reads a csv file as a single sheet, whatever name is requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvReader;

struct CsvDocument {
    rows: Vec<Vec<String>>,
}

impl TabularReader for CsvReader {
    fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn TabularDocument>, SourceError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes.as_slice());
        let mut rows = Vec::new();
        for (index, record) in reader.byte_records().enumerate() {
            let record = record.map_err(|err| SourceError::Open(err.to_string()))?;
            match decode_record(&record) {
                Some(cells) => rows.push(cells),
                None => {
                    // Left empty so the parser rejects and counts it.
                    debug!(row = index + 1, "csv row is not valid utf-8");
                    rows.push(Vec::new());
                }
            }
        }
        Ok(Box::new(CsvDocument { rows }))
    }
}

fn decode_record(record: &csv::ByteRecord) -> Option<Vec<String>> {
    record
        .iter()
        .map(|field| String::from_utf8(field.to_vec()).ok())
        .collect()
}

impl TabularDocument for CsvDocument {
    fn rows(&mut self, _sheet: &str) -> Result<Vec<Vec<String>>, SourceError> {
        Ok(std::mem::take(&mut self.rows))
    }
}

/// Row-level rejection; tallied, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("offer_id {0:?} is not an integer")]
    OfferId(String),
    #[error("price {0:?} is not a decimal")]
    Price(String),
    #[error("quantity {0:?} is not an integer")]
    Quantity(String),
    #[error("available {0:?} is not a boolean")]
    Available(String),
    #[error("offer_id is negative")]
    NegativeOfferId,
    #[error("name is empty")]
    EmptyName,
    #[error("price is negative")]
    NegativePrice,
    #[error("quantity is negative")]
    NegativeQuantity,
}

/// Whether the first row of the sheet is a header to be skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderRow {
    #[default]
    Skip,
    Absent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOutcome {
    pub offers: Vec<OfferDraft>,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordParser {
    sheet: String,
    header: HeaderRow,
}

impl Default for RecordParser {
    fn default() -> Self {
        Self::new(DEFAULT_SHEET, HeaderRow::Skip)
    }
}

impl RecordParser {
    pub fn new(sheet: impl Into<String>, header: HeaderRow) -> Self {
        Self {
            sheet: sheet.into(),
            header,
        }
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    pub fn header(&self) -> HeaderRow {
        self.header
    }

    /// Opens the container and parses the configured sheet.
    ///
    /// Only container and sheet failures are returned as errors; malformed
    /// rows are counted in [`ParseOutcome::errors`].
    pub fn parse(
        &self,
        reader: &dyn TabularReader,
        bytes: Vec<u8>,
    ) -> Result<ParseOutcome, SourceError> {
        let mut document = reader.open(bytes)?;
        let rows = document.rows(&self.sheet)?;
        Ok(self.parse_rows(&rows))
    }

    pub fn parse_rows(&self, rows: &[Vec<String>]) -> ParseOutcome {
        let skip = match self.header {
            HeaderRow::Skip => 1,
            HeaderRow::Absent => 0,
        };
        let mut outcome = ParseOutcome::default();

        for (index, row) in rows.iter().enumerate().skip(skip) {
            match parse_row(row) {
                Ok(draft) => outcome.offers.push(draft),
                Err(err) => {
                    debug!(row = index + 1, sheet = %self.sheet, %err, "rejected catalog row");
                    outcome.errors += 1;
                }
            }
        }

        outcome
    }
}

/// Parses the five catalog columns: offer_id, name, price, quantity, available.
pub fn parse_row(cells: &[String]) -> Result<OfferDraft, RowError> {
    let cell = |idx: usize| cells.get(idx).map(String::as_str).unwrap_or("");

    let offer_id = cell(0)
        .parse::<i64>()
        .map_err(|_| RowError::OfferId(cell(0).to_string()))?;
    let name = cell(1).to_string();
    let price = parse_decimal(cell(2)).ok_or_else(|| RowError::Price(cell(2).to_string()))?;
    let quantity = cell(3)
        .parse::<i64>()
        .map_err(|_| RowError::Quantity(cell(3).to_string()))?;
    let available =
        parse_bool(cell(4)).ok_or_else(|| RowError::Available(cell(4).to_string()))?;

    if offer_id < 0 {
        return Err(RowError::NegativeOfferId);
    }
    if name.is_empty() {
        return Err(RowError::EmptyName);
    }
    if price < Decimal::ZERO {
        return Err(RowError::NegativePrice);
    }
    if quantity < 0 {
        return Err(RowError::NegativeQuantity);
    }

    Ok(OfferDraft {
        offer_id,
        name,
        price,
        quantity,
        available,
    })
}

/// Optional sign, digits with at most one `.`, optional exponent.
fn parse_decimal(raw: &str) -> Option<Decimal> {
    let unsigned = raw.strip_prefix(|c| c == '+' || c == '-').unwrap_or(raw);
    let (mantissa, exponent) = match unsigned.find(|c| c == 'e' || c == 'E') {
        Some(at) => (&unsigned[..at], Some(&unsigned[at + 1..])),
        None => (unsigned, None),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !all_digits(int_part) || !all_digits(frac_part) {
        return None;
    }

    match exponent {
        None => Decimal::from_str(raw).ok(),
        Some(exp) => {
            let exp_digits = exp.strip_prefix(|c| c == '+' || c == '-').unwrap_or(exp);
            if exp_digits.is_empty() || !all_digits(exp_digits) {
                return None;
            }
            Decimal::from_scientific(&raw.to_ascii_lowercase()).ok()
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
