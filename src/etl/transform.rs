//! Row transformers: raw input rows to target records

use super::RawRow;
use crate::schema::{ColumnKind, Record, TableSchema};
use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Where a target field reads its value from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    /// Zero-based position in a positional row
    Index(usize),
    /// Header name in a named row
    Name(String),
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(i) => write!(f, "#{}", i),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Source of one target field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSource {
    Column(ColumnRef),
    /// Two coordinates for a [`ColumnKind::Point`] field
    Pair([ColumnRef; 2]),
}

/// Target field name to its source; `None` leaves the field unset
pub type FieldMapping = BTreeMap<String, Option<FieldSource>>;

/// Failures that stop a load
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Required data field '{column}' for '{field}' not found in input row")]
    MissingField { field: String, column: String },

    #[error("Field '{field}' expects {kind:?} but input was '{value}'")]
    InvalidNumber {
        field: String,
        kind: ColumnKind,
        value: String,
    },

    #[error("Field '{field}' has no entry in the field mapping")]
    InvalidMapping { field: String },

    #[error("Field '{field}' of kind {kind:?} cannot be read from {source_desc}")]
    KindMismatch {
        field: String,
        kind: ColumnKind,
        source_desc: String,
    },
}

/// Everything a transformer sees besides the row itself
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub schema: &'a TableSchema,
    pub mapping: &'a FieldMapping,
    pub null_equivalents: &'a [String],
    /// The primary key is synthetic and assigned by the store
    pub autoincrement: bool,
    pub primary_key: Option<&'a str>,
}

/// Result of transforming one raw row
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    One(Record),
    Many(Vec<Record>),
    /// The row does not have the shape the mapping expects; skip it
    Malformed,
}

impl Transformed {
    pub fn into_records(self) -> Vec<Record> {
        match self {
            Self::One(record) => vec![record],
            Self::Many(records) => records,
            Self::Malformed => Vec::new(),
        }
    }
}

/// Strategy that turns raw rows into target records
///
/// # Example
/// ```no_run
/// use chunk_loader::etl::{RawRow, RowTransformer, TransformContext, Transformed};
/// use chunk_loader::schema::Record;
/// use eyre::Result;
///
/// struct Upper;
///
/// impl RowTransformer for Upper {
///     fn name(&self) -> &str {
///         "upper"
///     }
///
///     fn transform(&self, row: &RawRow, _ctx: &TransformContext<'_>) -> Result<Transformed> {
///         let RawRow::Positional(cells) = row else {
///             return Ok(Transformed::Malformed);
///         };
///         let mut record = Record::new();
///         record.insert("name".into(), cells[0].to_uppercase().into());
///         Ok(Transformed::One(record))
///     }
/// }
/// ```
pub trait RowTransformer: Send + Sync {
    /// Recorded in the session log as `transformer_name`
    fn name(&self) -> &str;

    /// Transform a single raw row
    ///
    /// # Errors
    /// Any error is fatal to the load. Rows that merely have the wrong shape
    /// should return [`Transformed::Malformed`].
    fn transform(&self, row: &RawRow, ctx: &TransformContext<'_>) -> Result<Transformed>;
}

/// Default transformer driven entirely by the field mapping
#[derive(Debug, Clone, Copy, Default)]
pub struct MappedRowMaker;

impl MappedRowMaker {
    pub fn new() -> Self {
        Self
    }
}

enum Cell<'r> {
    Value(Option<&'r str>),
    OutOfRange,
}

fn lookup<'r>(row: &'r RawRow, column: &ColumnRef, field: &str) -> Result<Cell<'r>, TransformError> {
    match (row, column) {
        (RawRow::Positional(cells), ColumnRef::Index(i)) => Ok(cells
            .get(*i)
            .map(|c| Cell::Value(Some(c.as_str())))
            .unwrap_or(Cell::OutOfRange)),
        (RawRow::Named(fields), ColumnRef::Name(name)) => match fields.get(name) {
            Some(value) => Ok(Cell::Value(value.as_deref())),
            None => Err(TransformError::MissingField {
                field: field.to_string(),
                column: name.clone(),
            }),
        },
        (_, column) => Err(TransformError::MissingField {
            field: field.to_string(),
            column: column.to_string(),
        }),
    }
}

fn parse_number(field: &str, kind: ColumnKind, raw: &str) -> Result<Value, TransformError> {
    let invalid = || TransformError::InvalidNumber {
        field: field.to_string(),
        kind,
        value: raw.to_string(),
    };
    let cleaned = raw.trim().replace(',', "");
    let parsed: f64 = cleaned.parse().map_err(|_| invalid())?;
    if !parsed.is_finite() {
        return Err(invalid());
    }
    match kind {
        // Truncate toward zero, "1,234.9" becomes 1234
        ColumnKind::Integer => Ok(Value::from(parsed.trunc() as i64)),
        _ => Number::from_f64(parsed).map(Value::Number).ok_or_else(invalid),
    }
}

fn coordinate(cell: Cell<'_>) -> f64 {
    match cell {
        Cell::Value(Some(raw)) => raw.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// `POINT(x y)` literal with unparsable coordinates written as 0
pub fn make_point(x: f64, y: f64) -> String {
    format!("POINT({:?} {:?})", x, y)
}

impl RowTransformer for MappedRowMaker {
    fn name(&self) -> &str {
        "mapped_row"
    }

    fn transform(&self, row: &RawRow, ctx: &TransformContext<'_>) -> Result<Transformed> {
        let mut record = Record::new();

        for field in &ctx.schema.fields {
            let source = ctx
                .mapping
                .get(&field.name)
                .ok_or_else(|| TransformError::InvalidMapping {
                    field: field.name.clone(),
                })?;

            let value = match (source, field.kind) {
                (None, _) => Value::Null,
                (Some(FieldSource::Pair([x, y])), ColumnKind::Point) => {
                    let (x, y) = (lookup(row, x, &field.name)?, lookup(row, y, &field.name)?);
                    if matches!(x, Cell::OutOfRange) || matches!(y, Cell::OutOfRange) {
                        log::warn!("Coordinates for '{}' not found in input row", field.name);
                        return Ok(Transformed::Malformed);
                    }
                    Value::String(make_point(coordinate(x), coordinate(y)))
                }
                (Some(FieldSource::Pair(_)), kind) | (Some(FieldSource::Column(_)), kind @ ColumnKind::Point) => {
                    return Err(TransformError::KindMismatch {
                        field: field.name.clone(),
                        kind,
                        source_desc: format!("{:?}", source),
                    }
                    .into());
                }
                (Some(FieldSource::Column(column)), kind) => {
                    let raw = match lookup(row, column, &field.name)? {
                        Cell::Value(raw) => raw,
                        Cell::OutOfRange => {
                            log::warn!(
                                "Required element number '{}' not found in input row of {} cells",
                                column,
                                row.len()
                            );
                            return Ok(Transformed::Malformed);
                        }
                    };
                    match raw.filter(|r| !ctx.null_equivalents.iter().any(|n| n == r)) {
                        None => Value::Null,
                        Some(raw) => match kind {
                            ColumnKind::Integer | ColumnKind::Real => {
                                parse_number(&field.name, kind, raw)?
                            }
                            _ => Value::String(raw.to_string()),
                        },
                    }
                }
            };
            record.insert(field.name.clone(), value);
        }

        if ctx.autoincrement
            && let Some(key) = ctx.primary_key
        {
            record.insert(key.to_string(), Value::Null);
        }

        Ok(Transformed::One(record))
    }
}
