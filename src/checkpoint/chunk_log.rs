//! Outstanding chunks of a parallel build

use crate::etl::{Query, Selector, Store};
use crate::schema::{ColumnKind, FieldSpec, Row, TableSchema};
use eyre::{Context, Result};
use serde_json::{Value, json};
use std::sync::Arc;

pub const CHUNK_LOG_TABLE: &str = "chunk_log";

/// Ledger rows are written in batches of this size
const LEDGER_BATCH: usize = 1000;

/// A chunk still to be built, identified by its first key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLedgerEntry {
    pub chunk_number: i64,
    pub start_key_part_1: Option<String>,
    pub start_key_part_2: Option<String>,
}

impl ChunkLedgerEntry {
    fn into_row(self) -> Row {
        Row::Tuple(vec![
            json!(self.chunk_number),
            self.start_key_part_1.map(Value::String).unwrap_or(Value::Null),
            self.start_key_part_2.map(Value::String).unwrap_or(Value::Null),
        ])
    }
}

/// The persisted set of chunks not yet committed
pub struct ChunkLedger {
    store: Arc<dyn Store>,
}

impl ChunkLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn schema() -> TableSchema {
        TableSchema::new(
            CHUNK_LOG_TABLE,
            vec![
                FieldSpec::new("chunk_number", ColumnKind::Integer),
                FieldSpec::new("start_key_part_1", ColumnKind::Text),
                FieldSpec::new("start_key_part_2", ColumnKind::Text),
            ],
        )
    }

    /// Drop every entry, e.g. a partial ledger left by a crash mid-generation
    pub async fn clear(&self) -> Result<u64> {
        self.store
            .delete(Selector::table(CHUNK_LOG_TABLE).into())
            .await
            .context("Failed to clear chunk_log")
    }

    /// Persist a fresh ledger before any work starts
    pub async fn generate(&self, entries: Vec<ChunkLedgerEntry>) -> Result<usize> {
        let schema = Self::schema();
        let total = entries.len();
        let mut batch = Vec::with_capacity(LEDGER_BATCH);
        for entry in entries {
            batch.push(entry.into_row());
            if batch.len() == LEDGER_BATCH {
                self.store
                    .write(std::mem::take(&mut batch), &schema, false)
                    .await
                    .context("Failed to write chunk_log")?;
            }
        }
        if !batch.is_empty() {
            self.store
                .write(batch, &schema, false)
                .await
                .context("Failed to write chunk_log")?;
        }
        log::debug!("Wrote {} chunk_log entries", total);
        Ok(total)
    }

    /// Chunk numbers still outstanding, ascending
    pub async fn remaining(&self) -> Result<Vec<i64>> {
        let records = self
            .store
            .read(Selector::table(CHUNK_LOG_TABLE).into())
            .await?
            .try_collect()
            .await
            .context("Failed to read chunk_log")?;
        let mut chunks: Vec<i64> = records
            .iter()
            .filter_map(|r| r.get("chunk_number").and_then(Value::as_i64))
            .collect();
        chunks.sort_unstable();
        chunks.dedup();
        Ok(chunks)
    }

    /// Mark a chunk done; only call after its rows are written
    pub async fn remove(&self, chunk_number: i64) -> Result<()> {
        let query: Query = Selector::table(CHUNK_LOG_TABLE)
            .eq("chunk_number", chunk_number)
            .into();
        self.store
            .delete(query)
            .await
            .with_context(|| format!("Failed to remove chunk {} from chunk_log", chunk_number))?;
        Ok(())
    }
}
