//! Typed rows moved from the source table into the spreadsheet.
//!
//! # Field Order
//!
//! ```text
//! SourceRow:       [id, field_1 .. field_n]
//! DestinationRow:  [id, field_1 .. field_n, trailer]
//! DedupKey:        [id, field_1 .. field_n]            (all cells but the last)
//! ```
//!
//! The trailer is a destination-only column (annotation/status) written at
//! append time. It never takes part in deduplication.
//!
//! # Canonical Text
//!
//! The spreadsheet does not preserve the source column types: an integer
//! written as `30` may come back as the number `30` or the string `"30"`.
//! Dedup keys therefore compare the canonical text of each cell, never the
//! typed value.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::{Error, Result};

/// Largest integer magnitude a double represents exactly (2^53).
const MAX_EXACT_INT: u64 = 1 << 53;

/// 2^63 as a double: whole floats below this magnitude fit in an `i64`.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// A single scalar value in a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    /// Canonical text used for dedup comparison.
    ///
    /// Whole floats render without a fractional part (`30.0` -> `"30"`), so an
    /// integer and an equal float compare equal.
    pub fn canonical(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(true) => "TRUE".to_string(),
            Self::Bool(false) => "FALSE".to_string(),
            Self::Int(n) => n.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
        }
    }

    /// Encode the cell as a JSON value for a literal (RAW) write.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::String(String::new()),
            Self::Bool(b) => Value::Bool(*b),
            // Spreadsheet numbers are doubles; larger integers travel as text.
            Self::Int(n) if n.unsigned_abs() > MAX_EXACT_INT => Value::String(n.to_string()),
            Self::Int(n) => Value::from(*n),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(f.to_string())),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    /// Decode a cell returned by the destination.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Stable, unique identifier of a source row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowId {
    Int(i64),
    Text(String),
}

/// Key prefix bytes used by [`RowId::to_key_bytes`].
const KEY_TAG_INT: u8 = b'i';
const KEY_TAG_TEXT: u8 = b's';

impl RowId {
    /// Interpret a cell as a row identifier.
    ///
    /// Whole floats are accepted as integers; NULL, booleans and fractional
    /// floats are rejected.
    pub fn from_cell(cell: &Cell) -> Result<Self> {
        match cell {
            Cell::Int(n) => Ok(Self::Int(*n)),
            Cell::Text(s) if !s.is_empty() => Ok(Self::Text(s.clone())),
            // 2^63 itself is out of range; the cast would saturate.
            Cell::Float(f) if f.fract() == 0.0 && f.abs() < I64_BOUND => Ok(Self::Int(*f as i64)),
            other => Err(Error::InvalidRowId(format!("{other:?}"))),
        }
    }

    /// The identifier as it is written into the first destination column.
    pub fn to_cell(&self) -> Cell {
        match self {
            Self::Int(n) => Cell::Int(*n),
            Self::Text(s) => Cell::Text(s.clone()),
        }
    }

    /// Binary key: 1 tag byte followed by the big-endian integer or UTF-8 text.
    pub fn to_key_bytes(&self) -> Vec<u8> {
        match self {
            Self::Int(n) => {
                let mut key = Vec::with_capacity(9);
                key.push(KEY_TAG_INT);
                key.extend_from_slice(&n.to_be_bytes());
                key
            }
            Self::Text(s) => {
                let mut key = Vec::with_capacity(1 + s.len());
                key.push(KEY_TAG_TEXT);
                key.extend_from_slice(s.as_bytes());
                key
            }
        }
    }

    /// Decode a key produced by [`RowId::to_key_bytes`].
    pub fn from_key_bytes(key: &[u8]) -> Result<Self> {
        match key.split_first() {
            Some((&KEY_TAG_INT, rest)) => {
                let bytes: [u8; 8] = rest
                    .try_into()
                    .map_err(|_| Error::InvalidKey(format!("integer key of {} bytes", rest.len())))?;
                Ok(Self::Int(i64::from_be_bytes(bytes)))
            }
            Some((&KEY_TAG_TEXT, rest)) => std::str::from_utf8(rest)
                .map(|s| Self::Text(s.to_string()))
                .map_err(|e| Error::InvalidKey(e.to_string())),
            Some((tag, _)) => Err(Error::InvalidKey(format!("unknown tag byte {tag:#04x}"))),
            None => Err(Error::InvalidKey("empty key".to_string())),
        }
    }
}

impl FromStr for RowId {
    type Err = Error;

    /// Integers parse as [`RowId::Int`], anything else non-empty as text.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidRowId("empty".to_string()));
        }
        Ok(s.parse::<i64>()
            .map(Self::Int)
            .unwrap_or_else(|_| Self::Text(s.to_string())))
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Identifying subset of a row: canonical text of every cell but the trailer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(Vec<String>);

impl DedupKey {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

/// A row read from the source table.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub id: RowId,
    pub fields: Vec<Cell>,
}

impl SourceRow {
    pub fn new(id: RowId, fields: Vec<Cell>) -> Self {
        Self { id, fields }
    }

    /// Build a row from the selected columns, the first being the identifier.
    pub fn from_cells(mut cells: Vec<Cell>) -> Result<Self> {
        if cells.is_empty() {
            return Err(Error::MissingIdentifier);
        }
        let fields = cells.split_off(1);
        let id = RowId::from_cell(&cells[0])?;
        Ok(Self { id, fields })
    }

    /// Convert to the row written to the destination: `[id, fields.., trailer]`.
    pub fn to_destination(&self, trailer: &Cell) -> DestinationRow {
        let mut cells = Vec::with_capacity(self.fields.len() + 2);
        cells.push(self.id.to_cell());
        cells.extend(self.fields.iter().cloned());
        cells.push(trailer.clone());
        DestinationRow::new(cells)
    }
}

/// A row as stored in the destination range. Has no identifier of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationRow {
    cells: Vec<Cell>,
}

impl DestinationRow {
    pub fn new(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Dedup key: every cell except the trailing one.
    pub fn dedup_key(&self) -> DedupKey {
        let identifying = self.cells.split_last().map(|(_, rest)| rest).unwrap_or(&[]);
        DedupKey(identifying.iter().map(Cell::canonical).collect())
    }

    pub fn to_json(&self) -> Vec<Value> {
        self.cells.iter().map(Cell::to_json).collect()
    }

    pub fn from_json(values: &[Value]) -> Self {
        Self::new(values.iter().map(Cell::from_json).collect())
    }
}

/// Policy for the trailer cell appended to every written row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Trailer {
    /// RFC 3339 UTC timestamp of the sync pass.
    #[default]
    Timestamp,
    /// The same literal text on every row.
    Fixed(String),
}

impl Trailer {
    /// Reject trailers the destination would drop on read.
    ///
    /// Trailing blank cells are not returned by the spreadsheet, which would
    /// shift the dedup key of every row onto its last real field.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Fixed(text) if text.trim().is_empty() => Err(Error::InvalidTrailer(
                "fixed trailer must not be blank".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// The cell written for a pass started at `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> Cell {
        match self {
            Self::Timestamp => Cell::Text(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
            Self::Fixed(text) => Cell::Text(text.clone()),
        }
    }
}

impl FromStr for Trailer {
    type Err = Error;

    /// `timestamp` selects [`Trailer::Timestamp`]; any other text is fixed.
    fn from_str(s: &str) -> Result<Self> {
        let trailer = if s.eq_ignore_ascii_case("timestamp") {
            Self::Timestamp
        } else {
            Self::Fixed(s.to_string())
        };
        trailer.validate()?;
        Ok(trailer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn dest(values: Value) -> DestinationRow {
        DestinationRow::from_json(values.as_array().unwrap())
    }

    #[test]
    fn test_canonical_text() {
        assert_eq!(Cell::Null.canonical(), "");
        assert_eq!(Cell::Bool(true).canonical(), "TRUE");
        assert_eq!(Cell::Int(-7).canonical(), "-7");
        assert_eq!(Cell::Float(30.0).canonical(), "30");
        assert_eq!(Cell::Float(2.5).canonical(), "2.5");
        assert_eq!(Cell::from("Recife").canonical(), "Recife");
    }

    #[test]
    fn test_dedup_key_drops_trailer() {
        let row = dest(json!([1, "a", "x"]));
        assert_eq!(row.dedup_key(), DedupKey::new(vec!["1".into(), "a".into()]));
    }

    #[test]
    fn test_dedup_key_of_empty_row() {
        assert!(DestinationRow::new(vec![]).dedup_key().parts().is_empty());
    }

    #[test]
    fn test_source_matches_destination_across_types() {
        // Source has integer cells, the sheet answered with strings.
        let source = SourceRow::new(RowId::Int(1), vec![Cell::from("Ana"), Cell::Int(30)]);
        let written = source.to_destination(&Cell::from("2026-01-01T00:00:00Z"));
        let read_back = dest(json!(["1", "Ana", "30", "anything"]));
        assert_eq!(written.dedup_key(), read_back.dedup_key());
    }

    #[test]
    fn test_to_destination_layout() {
        let source = SourceRow::new(RowId::Int(3), vec![Cell::from("c")]);
        let row = source.to_destination(&Cell::from("sent"));
        assert_eq!(
            row.cells(),
            &[Cell::Int(3), Cell::from("c"), Cell::from("sent")]
        );
        assert_eq!(row.to_json(), vec![json!(3), json!("c"), json!("sent")]);
    }

    #[test]
    fn test_from_cells() {
        let row = SourceRow::from_cells(vec![Cell::Int(9), Cell::from("x")]).unwrap();
        assert_eq!(row.id, RowId::Int(9));
        assert_eq!(row.fields, vec![Cell::from("x")]);

        assert!(matches!(
            SourceRow::from_cells(vec![]),
            Err(Error::MissingIdentifier)
        ));
        assert!(matches!(
            SourceRow::from_cells(vec![Cell::Null, Cell::from("x")]),
            Err(Error::InvalidRowId(_))
        ));
    }

    #[test]
    fn test_row_id_from_whole_float() {
        assert_eq!(RowId::from_cell(&Cell::Float(12.0)).unwrap(), RowId::Int(12));
        assert!(RowId::from_cell(&Cell::Float(12.5)).is_err());
    }

    #[test]
    fn test_row_id_rejects_float_beyond_i64() {
        assert!(matches!(
            RowId::from_cell(&Cell::Float(1e19)),
            Err(Error::InvalidRowId(_))
        ));
        assert!(RowId::from_cell(&Cell::Float(-9.223_372_036_854_776e18)).is_err());
        assert_eq!(
            RowId::from_cell(&Cell::Float(-9.223_372_036_854_775e18)).unwrap(),
            RowId::Int(-9_223_372_036_854_774_784)
        );
    }

    #[test]
    fn test_large_int_survives_spreadsheet_round_trip() {
        let source = SourceRow::new(RowId::Int(9_007_199_254_740_993), vec![Cell::from("a")]);
        let written = source.to_destination(&Cell::from("t"));
        assert_eq!(written.to_json()[0], json!("9007199254740993"));

        // The sheet keeps text as-is and every number as a double.
        let read_back: Vec<Value> = written
            .to_json()
            .into_iter()
            .map(|v| match v.as_i64() {
                Some(n) => json!(n as f64),
                None => v,
            })
            .collect();
        assert_eq!(
            DestinationRow::from_json(&read_back).dedup_key(),
            written.dedup_key()
        );

        // Exactly representable integers stay numbers.
        assert_eq!(Cell::Int(1 << 53).to_json(), json!(9_007_199_254_740_992_i64));
        assert_eq!(Cell::Int(-(1 << 53) - 1).to_json(), json!("-9007199254740993"));
    }

    #[test]
    fn test_row_id_key_bytes() {
        let id = RowId::Int(-42);
        assert_eq!(RowId::from_key_bytes(&id.to_key_bytes()).unwrap(), id);

        let id = RowId::Text("vaga-7".to_string());
        assert_eq!(RowId::from_key_bytes(&id.to_key_bytes()).unwrap(), id);

        assert!(RowId::from_key_bytes(&[]).is_err());
        assert!(RowId::from_key_bytes(&[b'i', 1, 2]).is_err());
        assert!(RowId::from_key_bytes(&[b'z']).is_err());
    }

    #[test]
    fn test_row_id_from_str() {
        assert_eq!("17".parse::<RowId>().unwrap(), RowId::Int(17));
        assert_eq!(
            "abc".parse::<RowId>().unwrap(),
            RowId::Text("abc".to_string())
        );
        assert!("  ".parse::<RowId>().is_err());
    }

    #[test]
    fn test_cell_from_json_numbers() {
        assert_eq!(Cell::from_json(&json!(5)), Cell::Int(5));
        assert_eq!(Cell::from_json(&json!(5.5)), Cell::Float(5.5));
        assert_eq!(Cell::from_json(&json!(null)), Cell::Null);
    }

    #[test]
    fn test_trailer_policy() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap();
        assert_eq!(
            Trailer::Timestamp.resolve(now),
            Cell::from("2026-10-18T09:30:00Z")
        );
        assert_eq!(
            "synced".parse::<Trailer>().unwrap().resolve(now),
            Cell::from("synced")
        );
        assert_eq!("TIMESTAMP".parse::<Trailer>().unwrap(), Trailer::Timestamp);
        assert!(" ".parse::<Trailer>().is_err());
        assert!(Trailer::Fixed(String::new()).validate().is_err());
    }
}
