//! One row per distinct input identity

use crate::schema::{ColumnKind, FieldSpec, Record, TableSchema};
use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const METADATA_TABLE: &str = "metadata";

/// Lifecycle of an input identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadState {
    Started,
    Complete,
}

impl LoadState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "Started",
            Self::Complete => "Complete",
        }
    }
}

/// Progress of one input identity across every run that touched it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub sequence_number: i64,
    pub data_path: String,
    pub content_hash: String,
    pub status: LoadState,
    pub start_time: Option<String>,
    pub finish_time: Option<String>,
    pub last_write_time: Option<String>,
    /// Chunks durably committed to the target table
    pub chunk_count: i64,
}

impl MetadataRecord {
    pub fn schema() -> TableSchema {
        TableSchema::new(
            METADATA_TABLE,
            vec![
                FieldSpec::key("sequence_number", ColumnKind::Integer),
                FieldSpec::new("data_path", ColumnKind::Text),
                FieldSpec::new("content_hash", ColumnKind::Text),
                FieldSpec::new("status", ColumnKind::Text),
                FieldSpec::new("start_time", ColumnKind::Text),
                FieldSpec::new("finish_time", ColumnKind::Text),
                FieldSpec::new("last_write_time", ColumnKind::Text),
                FieldSpec::new("chunk_count", ColumnKind::Integer),
            ],
        )
    }

    pub fn is_complete(&self) -> bool {
        self.status == LoadState::Complete
    }

    pub fn to_record(&self) -> Result<Record> {
        to_record(self)
    }

    pub fn from_record(record: Record) -> Result<Self> {
        serde_json::from_value(Value::Object(record)).context("Malformed metadata row")
    }
}

pub(super) fn to_record<T: Serialize>(value: &T) -> Result<Record> {
    match serde_json::to_value(value)? {
        Value::Object(record) => Ok(record),
        other => bail!("Expected a record, serialized to {}", other),
    }
}
