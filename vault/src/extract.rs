//! Extractor: unsealed bytes to a lazy stream of checked rows
//!
//! The header is resolved eagerly (a missing required column is a structural
//! [`ExtractError::SchemaInvalid`]); rows are then parsed one at a time as
//! the [`RecordStream`] is pulled. Every row comes out as a
//! [`RowOutcome`], so row-level problems never abort the dataset.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::NaiveDate;
use csv::{ByteRecord, Position, Reader, ReaderBuilder};
use serde::{Deserialize, Serialize};

use crate::buffer::UnsealedBuffer;
use crate::config::ExtractionConfig;
use crate::error::{ExtractError, ExtractResult};
use crate::model::{Column, QuarantineReason, QuarantinedRow, RawRecord, RowOutcome, ValidatedRecord};

/// Source header spellings accepted for each canonical column, lowercase
const COLUMN_ALIASES: [(Column, &[&str]); 9] = [
    (Column::Sku, &["sku", "idproducto", "id_producto", "id producto"]),
    (Column::Description, &["description", "producto"]),
    (Column::Category, &["category", "rubro"]),
    (Column::Lab, &["lab", "vendor", "laboratorio"]),
    (Column::Quantity, &["quantity", "cajas vend.", "cajas vend", "cajas vendidas"]),
    (Column::UnitCost, &["unit_cost", "costo"]),
    (Column::UnitPrice, &["unit_price", "pvp"]),
    (Column::Date, &["date", "fecha"]),
    (Column::Stock, &["stock", "cajas stock"]),
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];

/// Field delimiter of a sales export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    /// Sniffed from the header line
    #[default]
    Auto,
    Semicolon,
    Comma,
    Tab,
}

impl Delimiter {
    /// Delimiter byte, or `None` for `Auto`
    pub fn byte(&self) -> Option<u8> {
        match self {
            Delimiter::Auto => None,
            Delimiter::Semicolon => Some(b';'),
            Delimiter::Comma => Some(b','),
            Delimiter::Tab => Some(b'\t'),
        }
    }

    /// Pick the most frequent candidate in a header line. Ties go to
    /// semicolon, then tab, then comma; a line with none of them is
    /// treated as comma separated.
    pub fn sniff(header_line: &[u8]) -> u8 {
        let count = |needle: u8| header_line.iter().filter(|&&b| b == needle).count();

        let mut best = (b',', 0);
        for candidate in [b';', b'\t', b','] {
            let occurrences = count(candidate);
            if occurrences > best.1 {
                best = (candidate, occurrences);
            }
        }
        best.0
    }

    fn resolve(&self, header_line: &[u8]) -> u8 {
        self.byte().unwrap_or_else(|| Delimiter::sniff(header_line))
    }
}

/// Row counters of one extraction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractStats {
    pub rows_read: u64,
    pub valid: u64,
    pub quarantined: u64,
}

/// Header positions of the canonical columns plus passthrough columns
#[derive(Debug, Clone)]
struct ColumnMap {
    positions: [Option<usize>; 9],
    extras: Vec<(usize, String)>,
}

impl ColumnMap {
    fn resolve(headers: &ByteRecord) -> ExtractResult<Self> {
        if headers.is_empty() || headers.iter().all(|h| decode_cell(h).trim().is_empty()) {
            return Err(ExtractError::MissingHeader);
        }

        let mut positions = [None; 9];
        let mut extras = Vec::new();

        for (index, raw) in headers.iter().enumerate() {
            let name = decode_cell(raw).trim().to_string();
            let lowered = name.to_lowercase();

            let canonical = COLUMN_ALIASES
                .iter()
                .find(|(_, aliases)| aliases.contains(&lowered.as_str()))
                .map(|(column, _)| *column);

            match canonical {
                Some(column) if positions[column.index()].is_none() => {
                    positions[column.index()] = Some(index);
                }
                Some(_) => {}
                None if !name.is_empty() => extras.push((index, name)),
                None => {}
            }
        }

        let missing: Vec<String> = Column::ALL
            .iter()
            .filter(|column| column.is_required() && positions[column.index()].is_none())
            .map(|column| column.name().to_string())
            .collect();

        if !missing.is_empty() {
            return Err(ExtractError::SchemaInvalid { missing });
        }

        Ok(Self { positions, extras })
    }

    fn cell<'r>(&self, record: &'r ByteRecord, column: Column) -> Cow<'r, str> {
        let value = self.positions[column.index()]
            .and_then(|index| record.get(index))
            .map(decode_cell)
            .unwrap_or(Cow::Borrowed(""));

        match value {
            Cow::Borrowed(s) => Cow::Borrowed(s.trim()),
            Cow::Owned(s) => Cow::Owned(s.trim().to_string()),
        }
    }
}

/// Row-level validation rules
#[derive(Debug, Clone)]
struct RowRules {
    allow_zero_quantity: bool,
    placeholders: Vec<String>,
}

/// Parses unsealed buffers into record streams
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    config: ExtractionConfig,
}

impl Extractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    /// Resolve the header of `buffer` and return a lazy row stream over it.
    /// The stream borrows the buffer and cannot outlive it.
    pub fn parse<'a>(&self, buffer: &'a UnsealedBuffer) -> ExtractResult<RecordStream<'a>> {
        let bytes = buffer.as_bytes();
        let skip_rows = self.config.skip_rows;
        let body = skip_lines(bytes, skip_rows);

        let header_line = body.split(|&b| b == b'\n').next().unwrap_or_default();
        let delimiter = self.config.delimiter_for(buffer.dataset_id()).resolve(header_line);

        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(body);

        let headers = reader
            .byte_headers()
            .map_err(|e| ExtractError::HeaderUnreadable { reason: e.to_string() })?
            .clone();
        let columns = ColumnMap::resolve(&headers)?;

        tracing::debug!(
            dataset = %buffer.dataset_id(),
            delimiter = %(delimiter as char).escape_default(),
            extra_columns = columns.extras.len(),
            "Resolved header"
        );

        Ok(RecordStream {
            reader,
            columns,
            rules: RowRules {
                allow_zero_quantity: self.config.allow_zero_quantity,
                placeholders: self
                    .config
                    .placeholder_products
                    .iter()
                    .map(|p| p.trim().to_lowercase())
                    .collect(),
            },
            record: ByteRecord::new(),
            line_offset: skip_rows as u64,
            stats: ExtractStats::default(),
        })
    }
}

/// Lazy, single-pass sequence of [`RowOutcome`]s over one buffer
pub struct RecordStream<'a> {
    reader: Reader<&'a [u8]>,
    columns: ColumnMap,
    rules: RowRules,
    record: ByteRecord,
    line_offset: u64,
    stats: ExtractStats,
}

impl RecordStream<'_> {
    /// Counters for the rows pulled so far
    pub fn stats(&self) -> ExtractStats {
        self.stats
    }

    fn check_row(&self) -> Result<RawRecord, QuarantineReason> {
        let record = &self.record;
        let columns = &self.columns;

        let description = columns.cell(record, Column::Description);
        if self.rules.placeholders.contains(&description.to_lowercase()) {
            return Err(QuarantineReason::Placeholder);
        }

        let sku = required_text(columns, record, Column::Sku)?;
        if description.is_empty() {
            return Err(QuarantineReason::MissingValue(Column::Description));
        }
        let category = required_text(columns, record, Column::Category)?;
        let lab = required_text(columns, record, Column::Lab)?;

        let quantity = required_amount(columns, record, Column::Quantity)?;
        let unit_cost = required_amount(columns, record, Column::UnitCost)?;
        let unit_price = required_amount(columns, record, Column::UnitPrice)?;

        let date_cell = columns.cell(record, Column::Date);
        if date_cell.is_empty() {
            return Err(QuarantineReason::MissingValue(Column::Date));
        }
        let date = parse_date(&date_cell).ok_or(QuarantineReason::InvalidDate(Column::Date))?;

        let stock_cell = columns.cell(record, Column::Stock);
        let stock = if stock_cell.is_empty() {
            None
        } else {
            Some(checked_amount(&stock_cell, Column::Stock)?)
        };

        if quantity == 0.0 && !self.rules.allow_zero_quantity {
            return Err(QuarantineReason::ZeroQuantity);
        }

        let attributes = columns
            .extras
            .iter()
            .filter_map(|(index, name)| {
                let value = record.get(*index).map(decode_cell)?;
                let value = value.trim();
                (!value.is_empty()).then(|| (name.clone(), value.to_string()))
            })
            .collect::<BTreeMap<_, _>>();

        Ok(RawRecord {
            sku,
            description: description.into_owned(),
            category,
            lab,
            quantity,
            unit_cost,
            unit_price,
            date,
            stock,
            attributes,
        })
    }
}

impl Iterator for RecordStream<'_> {
    type Item = RowOutcome;

    fn next(&mut self) -> Option<RowOutcome> {
        let read = self.reader.read_byte_record(&mut self.record);
        let line = read_line(&read, &self.record, self.reader.position()) + self.line_offset;

        let checked = match read {
            Ok(false) => return None,
            Ok(true) => self.check_row(),
            Err(_) => Err(QuarantineReason::Malformed),
        };

        self.stats.rows_read += 1;
        match checked {
            Ok(record) => {
                self.stats.valid += 1;
                Some(RowOutcome::Valid(ValidatedRecord { line, record }))
            }
            Err(reason) => {
                self.stats.quarantined += 1;
                tracing::debug!(line, reason = %reason, "Quarantined row");
                Some(RowOutcome::Quarantined(QuarantinedRow { line, reason }))
            }
        }
    }
}

fn required_text(columns: &ColumnMap, record: &ByteRecord, column: Column) -> Result<String, QuarantineReason> {
    let value = columns.cell(record, column);
    if value.is_empty() {
        return Err(QuarantineReason::MissingValue(column));
    }
    Ok(value.into_owned())
}

fn required_amount(columns: &ColumnMap, record: &ByteRecord, column: Column) -> Result<f64, QuarantineReason> {
    let value = columns.cell(record, column);
    if value.is_empty() {
        return Err(QuarantineReason::MissingValue(column));
    }
    checked_amount(&value, column)
}

fn checked_amount(value: &str, column: Column) -> Result<f64, QuarantineReason> {
    let number = parse_number(value).ok_or(QuarantineReason::InvalidNumber(column))?;
    if number < 0.0 {
        return Err(QuarantineReason::OutOfRange(column));
    }
    Ok(number)
}

/// Skip `count` newline-terminated lines
fn skip_lines(bytes: &[u8], count: usize) -> &[u8] {
    let mut rest = bytes;
    for _ in 0..count {
        match rest.iter().position(|&b| b == b'\n') {
            Some(pos) => rest = &rest[pos + 1..],
            None => return &rest[rest.len()..],
        }
    }
    rest
}

/// UTF-8 when valid, Latin-1 otherwise
pub fn decode_cell(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
    }
}

/// Parse an amount such as `1.234,50`, `$ 1,234.50` or `12`.
///
/// With both separators present the last one is the decimal point. With a
/// single separator kind, one occurrence is a decimal point and several are
/// thousands separators.
pub fn parse_number(value: &str) -> Option<f64> {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '$' && *c != '€')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) if dot > comma => cleaned.replace(',', ""),
        (Some(_), Some(_)) => cleaned.replace('.', "").replace(',', "."),
        (None, Some(_)) if cleaned.matches(',').count() == 1 => cleaned.replace(',', "."),
        (None, Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        _ => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Source line of the last read. A failed read leaves `record` holding the
/// previous row, so its line comes from the error or the reader instead.
fn read_line(read: &csv::Result<bool>, record: &ByteRecord, reader_position: &Position) -> u64 {
    match read {
        Ok(_) => record.position().unwrap_or(reader_position).line(),
        Err(e) => e.position().unwrap_or(reader_position).line(),
    }
}

/// Parse a calendar date; a trailing time part is ignored
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let date_part = value.split(|c| c == ' ' || c == 'T').next().unwrap_or(value);
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(date_part, format).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    const HEADER: &str = "sku;description;category;lab;quantity;unit_cost;unit_price;date\n";

    fn buffer(id: &str, text: &[u8]) -> UnsealedBuffer {
        UnsealedBuffer::new(id, Zeroizing::new(text.to_vec()))
    }

    fn extractor() -> Extractor {
        Extractor::new(ExtractionConfig::default())
    }

    fn collect(stream: RecordStream<'_>) -> (Vec<ValidatedRecord>, Vec<QuarantinedRow>) {
        let mut valid = Vec::new();
        let mut quarantined = Vec::new();
        for outcome in stream {
            match outcome {
                RowOutcome::Valid(record) => valid.push(record),
                RowOutcome::Quarantined(row) => quarantined.push(row),
            }
        }
        (valid, quarantined)
    }

    #[test]
    fn test_parse_valid_rows() {
        let payload = format!("{}A1;Ibuprofeno;ANALG;BAGO;10;5;8;2024-01-15\n", HEADER);
        let buffer = buffer("enero", payload.as_bytes());
        let (valid, quarantined) = collect(extractor().parse(&buffer).unwrap());

        assert!(quarantined.is_empty());
        assert_eq!(valid.len(), 1);
        let row = &valid[0];
        assert_eq!(row.line, 2);
        assert_eq!(row.record.sku, "A1");
        assert_eq!(row.record.quantity, 10.0);
        assert_eq!(row.record.unit_price, 8.0);
        assert_eq!(row.record.date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(row.record.stock, None);
    }

    #[test]
    fn test_missing_required_column() {
        let payload = b"sku;description;category;lab;quantity;unit_cost;date\nA1;x;c;l;1;2;2024-01-01\n";
        let buffer = buffer("enero", payload);
        match extractor().parse(&buffer) {
            Err(ExtractError::SchemaInvalid { missing }) => assert_eq!(missing, vec!["unit_price".to_string()]),
            other => panic!("expected SchemaInvalid, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_empty_payload_has_no_header() {
        let buffer = buffer("enero", b"");
        assert!(matches!(extractor().parse(&buffer), Err(ExtractError::MissingHeader)));
    }

    #[test]
    fn test_row_level_quarantine() {
        let payload = format!(
            "{}{}{}{}{}{}{}",
            HEADER,
            "A1;x;c;l;abc;5;8;2024-01-15\n",
            "A2;x;c;l;1;5;-8;2024-01-15\n",
            "A3;x;c;l;1;5;8;2024-02-30\n",
            ";x;c;l;1;5;8;2024-01-15\n",
            "A5;zzzz;c;l;1;5;8;2024-01-15\n",
            "A6;x;c;l;0;5;8;2024-01-15\n",
        );
        let buffer = buffer("enero", payload.as_bytes());
        let mut stream = extractor().parse(&buffer).unwrap();
        let outcomes: Vec<RowOutcome> = stream.by_ref().collect();

        let reasons: Vec<QuarantineReason> = outcomes
            .into_iter()
            .map(|outcome| match outcome {
                RowOutcome::Quarantined(row) => row.reason,
                RowOutcome::Valid(_) => panic!("row should have been quarantined"),
            })
            .collect();

        assert_eq!(
            reasons,
            vec![
                QuarantineReason::InvalidNumber(Column::Quantity),
                QuarantineReason::OutOfRange(Column::UnitPrice),
                QuarantineReason::InvalidDate(Column::Date),
                QuarantineReason::MissingValue(Column::Sku),
                QuarantineReason::Placeholder,
                QuarantineReason::ZeroQuantity,
            ]
        );
        assert_eq!(stream.stats(), ExtractStats { rows_read: 6, valid: 0, quarantined: 6 });
    }

    #[test]
    fn test_zero_quantity_allowed_by_policy() {
        let config = ExtractionConfig { allow_zero_quantity: true, ..ExtractionConfig::default() };
        let payload = format!("{}A6;x;c;l;0;5;8;2024-01-15\n", HEADER);
        let buffer = buffer("enero", payload.as_bytes());
        let (valid, _) = collect(Extractor::new(config).parse(&buffer).unwrap());
        assert_eq!(valid.len(), 1);
    }

    #[test]
    fn test_source_export_layout() {
        // Preamble, Spanish headers, tab separated, Latin-1 cells
        let mut payload = b"Farmacia Central\nReporte de ventas\n".to_vec();
        payload.extend_from_slice(b"IDProducto\tProducto\tRubro\tLaboratorio\tCajas Vend.\tCosto\tPVP\tFecha\tCajas Stock\tSucursal\n");
        payload.extend_from_slice(b"B7\tJarabe ni\xf1os\tPEDIAT\tROEMMERS\t3\t1.200,50\t$ 2.500,00\t15/01/2024\t12\tCentro\n");

        let config = ExtractionConfig { skip_rows: 2, ..ExtractionConfig::default() };
        let buffer = buffer("noviembre", &payload);
        let (valid, quarantined) = collect(Extractor::new(config).parse(&buffer).unwrap());

        assert!(quarantined.is_empty());
        let row = &valid[0];
        assert_eq!(row.line, 4);
        assert_eq!(row.record.description, "Jarabe niños");
        assert_eq!(row.record.unit_cost, 1200.5);
        assert_eq!(row.record.unit_price, 2500.0);
        assert_eq!(row.record.stock, Some(12.0));
        assert_eq!(row.record.attributes.get("Sucursal").map(String::as_str), Some("Centro"));
    }

    #[test]
    fn test_dataset_delimiter_override() {
        let mut config = ExtractionConfig::default();
        config.dataset_delimiters.insert("marzo".to_string(), Delimiter::Comma);

        let payload = b"sku,description,category,lab,quantity,unit_cost,unit_price,date\nA1,x;y,c,l,1,5,8,2024-03-01\n";
        let buffer = buffer("marzo", payload);
        let (valid, _) = collect(Extractor::new(config).parse(&buffer).unwrap());
        assert_eq!(valid[0].record.description, "x;y");
    }

    #[test]
    fn test_sniff_delimiter() {
        assert_eq!(Delimiter::sniff(b"a;b;c"), b';');
        assert_eq!(Delimiter::sniff(b"a\tb\tc"), b'\t');
        assert_eq!(Delimiter::sniff(b"a,b,c"), b',');
        assert_eq!(Delimiter::sniff(b"single"), b',');
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("12"), Some(12.0));
        assert_eq!(parse_number("12,5"), Some(12.5));
        assert_eq!(parse_number("1.234,56"), Some(1234.56));
        assert_eq!(parse_number("$ 1,234.56"), Some(1234.56));
        assert_eq!(parse_number("1.234.567"), Some(1234567.0));
        assert_eq!(parse_number("-3"), Some(-3.0));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn test_parse_date() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 15);
        assert_eq!(parse_date("2024-01-15"), expected);
        assert_eq!(parse_date("15/01/2024"), expected);
        assert_eq!(parse_date("15-01-2024"), expected);
        assert_eq!(parse_date("2024-01-15 00:00:00"), expected);
        assert_eq!(parse_date("2024-13-01"), None);
    }

    #[test]
    fn test_failed_read_reports_its_own_line() {
        let data = b"sku\nA1\nA2\n";
        let mut reader = ReaderBuilder::new().from_reader(&data[..]);
        let mut record = ByteRecord::new();
        assert!(reader.read_byte_record(&mut record).unwrap());
        assert_eq!(read_line(&Ok(true), &record, reader.position()), 2);

        // The buffer still holds A1 when the next read fails.
        let failed: csv::Result<bool> =
            Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "torn row").into());
        let line = read_line(&failed, &record, reader.position());
        assert!(line > 2);
        assert_eq!(line, reader.position().line());
    }
}
