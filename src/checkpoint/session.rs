//! One row per run attempt

use super::metadata::to_record;
use crate::schema::{ColumnKind, FieldSpec, Record, TableSchema};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SESSION_LOG_TABLE: &str = "session_log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLogRecord {
    pub id: i64,
    pub transformer_name: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub content_hash: String,
    pub first_chunk: i64,
    /// Stored in a REAL column
    #[serde(with = "real_chunk")]
    pub last_chunk: i64,
}

mod real_chunk {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(*value as f64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        Ok(f64::deserialize(deserializer)? as i64)
    }
}

impl SessionLogRecord {
    pub fn schema() -> TableSchema {
        TableSchema::new(
            SESSION_LOG_TABLE,
            vec![
                FieldSpec::key("id", ColumnKind::Integer),
                FieldSpec::new("transformer_name", ColumnKind::Text),
                FieldSpec::new("start_time", ColumnKind::Text),
                FieldSpec::new("end_time", ColumnKind::Text),
                FieldSpec::new("content_hash", ColumnKind::Text),
                FieldSpec::new("first_chunk", ColumnKind::Integer),
                FieldSpec::new("last_chunk", ColumnKind::Real),
            ],
        )
    }

    pub fn to_record(&self) -> Result<Record> {
        to_record(self)
    }

    pub fn from_record(record: Record) -> Result<Self> {
        serde_json::from_value(Value::Object(record)).context("Malformed session_log row")
    }
}
