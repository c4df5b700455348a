//! Table schemas, column kinds, and the record shapes written to a store
//!
//! A [`TableSchema`] is used twice: once by a store adapter to create the
//! table or index, and once by a row transformer to coerce raw input into a
//! [`Record`]. Both sides match on the same closed [`ColumnKind`] enum.

use eyre::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Table name used when a load does not name its destination table
pub const DEFAULT_TABLE: &str = "property_data";

/// A target record: field name to value, keyed by the destination schema
pub type Record = Map<String, Value>;

/// Column kinds understood by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnKind {
    #[serde(alias = "INT", alias = "integer")]
    Integer,
    #[serde(alias = "FLOAT", alias = "real", alias = "float")]
    Real,
    #[serde(alias = "text")]
    Text,
    /// A two-coordinate geometry, stored as a `POINT(x y)` literal
    #[serde(alias = "point")]
    Point,
}

impl ColumnKind {
    /// Column type used in a relational `CREATE TABLE`
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            // SQLite has no geometry type, WKT text is stored as-is
            Self::Point => "TEXT",
        }
    }

    /// Field type used in a document index mapping
    pub fn mapping_type(self) -> &'static str {
        match self {
            Self::Integer => "long",
            Self::Real => "double",
            Self::Text => "keyword",
            Self::Point => "geo_point",
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A single column of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: ColumnKind,
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    /// Ask the backend for AUTOINCREMENT semantics (never reuse a key)
    #[serde(default, skip_serializing_if = "is_false")]
    pub autoincrement: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            primary_key: false,
            autoincrement: false,
        }
    }

    /// A primary-key column
    pub fn key(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            primary_key: true,
            ..Self::new(name, kind)
        }
    }
}

/// A named table and its ordered columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default = "default_table_name")]
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

fn default_table_name() -> String {
    DEFAULT_TABLE.to_string()
}

impl TableSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// The primary-key field used for in-run deduplication
    ///
    /// With a composite key the last key column wins, matching how the
    /// key is located when the schema is scanned top to bottom.
    pub fn primary_key(&self) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|f| f.primary_key)
            .map(|f| f.name.as_str())
    }

    /// Every column flagged as part of the primary key, in declaration order
    pub fn key_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.name.as_str())
            .collect()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// A row handed to [`Store::write`](crate::etl::Store::write)
///
/// Rows may be field-keyed records or tuples ordered like the schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Keyed(Record),
    Tuple(Vec<Value>),
}

impl Row {
    /// Values in schema column order
    ///
    /// Fields missing from a keyed record are written as null; fields the
    /// schema does not know about are a schema mismatch.
    pub fn into_values(self, schema: &TableSchema) -> Result<Vec<Value>> {
        match self {
            Self::Keyed(mut record) => {
                let values = schema
                    .fields
                    .iter()
                    .map(|f| record.remove(&f.name).unwrap_or(Value::Null))
                    .collect();
                if let Some(extra) = record.keys().next() {
                    bail!(
                        "Field '{}' is not part of table '{}'",
                        extra,
                        schema.name
                    );
                }
                Ok(values)
            }
            Self::Tuple(values) => {
                if values.len() != schema.fields.len() {
                    bail!(
                        "Row has {} values but table '{}' has {} fields",
                        values.len(),
                        schema.name,
                        schema.fields.len()
                    );
                }
                Ok(values)
            }
        }
    }

    /// A field-keyed record for this row
    pub fn into_record(self, schema: &TableSchema) -> Result<Record> {
        let values = self.into_values(schema)?;
        Ok(schema
            .field_names()
            .map(str::to_string)
            .zip(values)
            .collect())
    }
}

impl From<Record> for Row {
    fn from(record: Record) -> Self {
        Self::Keyed(record)
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::Tuple(values)
    }
}
