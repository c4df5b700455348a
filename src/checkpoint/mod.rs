//! Durable record of load progress
//!
//! The ledger lives in the same store as the data it describes. A run
//! finds or creates the [`MetadataRecord`] for its input identity, opens a
//! [`SessionLogRecord`], and advances both after every committed chunk.
//! Restarting after a crash resumes from the metadata's `chunk_count`.

mod chunk_log;
mod metadata;
mod session;

pub use chunk_log::{CHUNK_LOG_TABLE, ChunkLedger, ChunkLedgerEntry};
pub use metadata::{LoadState, METADATA_TABLE, MetadataRecord};
pub use session::{SESSION_LOG_TABLE, SessionLogRecord};

use crate::etl::{Order, Selector, Store};
use crate::schema::{Record, Row, TableSchema};
use eyre::{Context, Result};
use serde_json::{Value, json};
use std::sync::Arc;

/// Wall-clock timestamp in the ledger's text format
pub fn now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Metadata and session bookkeeping over a store
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Tables the ledger needs alongside the data tables
    pub fn tables() -> Vec<TableSchema> {
        vec![MetadataRecord::schema(), SessionLogRecord::schema()]
    }

    /// Whether a completed load of `content_hash` is recorded
    ///
    /// Never creates the store or its tables.
    pub async fn is_complete(&self, content_hash: &str) -> Result<bool> {
        if !self.store.has_table(METADATA_TABLE).await? {
            return Ok(false);
        }
        let found = self
            .store
            .read(
                Selector::table(METADATA_TABLE)
                    .eq("content_hash", content_hash)
                    .eq("status", LoadState::Complete.as_str())
                    .limit(1)
                    .into(),
            )
            .await?
            .try_collect()
            .await?;
        Ok(!found.is_empty())
    }

    /// Latest metadata for `content_hash`, if any run ever started it
    pub async fn find(&self, content_hash: &str) -> Result<Option<MetadataRecord>> {
        if !self.store.has_table(METADATA_TABLE).await? {
            return Ok(None);
        }
        let mut records = self
            .store
            .read(
                Selector::table(METADATA_TABLE)
                    .eq("content_hash", content_hash)
                    .order_by("sequence_number", Order::Desc)
                    .limit(1)
                    .into(),
            )
            .await?
            .try_collect()
            .await
            .context("Failed to read metadata")?;
        records.pop().map(MetadataRecord::from_record).transpose()
    }

    /// Every metadata record, oldest first
    pub async fn history(&self) -> Result<Vec<MetadataRecord>> {
        if !self.store.has_table(METADATA_TABLE).await? {
            return Ok(Vec::new());
        }
        self.store
            .read(
                Selector::table(METADATA_TABLE)
                    .order_by("sequence_number", Order::Asc)
                    .into(),
            )
            .await?
            .try_collect()
            .await?
            .into_iter()
            .map(MetadataRecord::from_record)
            .collect()
    }

    /// Sessions that worked on `content_hash`, oldest first
    pub async fn sessions(&self, content_hash: &str) -> Result<Vec<SessionLogRecord>> {
        if !self.store.has_table(SESSION_LOG_TABLE).await? {
            return Ok(Vec::new());
        }
        self.store
            .read(
                Selector::table(SESSION_LOG_TABLE)
                    .eq("content_hash", content_hash)
                    .order_by("id", Order::Asc)
                    .into(),
            )
            .await?
            .try_collect()
            .await?
            .into_iter()
            .map(SessionLogRecord::from_record)
            .collect()
    }

    /// Find or create the metadata record a run will advance
    ///
    /// An existing record is reused so `chunk_count` carries over between
    /// runs. A record already marked Complete (only reachable when the
    /// caller chose to reload) restarts from zero.
    pub async fn begin(&self, data_path: &str, content_hash: &str) -> Result<MetadataRecord> {
        let schema = MetadataRecord::schema();
        if let Some(mut existing) = self.find(content_hash).await? {
            if existing.is_complete() {
                existing.status = LoadState::Started;
                existing.chunk_count = 0;
                existing.start_time = Some(now());
                self.store
                    .update(vec![existing.to_record()?], &schema, &["sequence_number"])
                    .await
                    .context("Failed to reset metadata")?;
            }
            log::debug!(
                "Resuming metadata #{} at chunk {}",
                existing.sequence_number,
                existing.chunk_count
            );
            return Ok(existing);
        }

        let sequence_number = self.next_id(METADATA_TABLE, "sequence_number").await?;
        let metadata = MetadataRecord {
            sequence_number,
            data_path: data_path.to_string(),
            content_hash: content_hash.to_string(),
            status: LoadState::Started,
            start_time: Some(now()),
            finish_time: None,
            last_write_time: None,
            chunk_count: 0,
        };
        self.store
            .write(vec![Row::Keyed(metadata.to_record()?)], &schema, false)
            .await
            .context("Failed to create metadata")?;
        log::debug!("Created metadata #{} for {}", sequence_number, data_path);
        Ok(metadata)
    }

    /// Open a session starting at `first_chunk`
    pub async fn open_session(
        &self,
        transformer_name: &str,
        content_hash: &str,
        first_chunk: i64,
    ) -> Result<SessionLogRecord> {
        let session = SessionLogRecord {
            id: self.next_id(SESSION_LOG_TABLE, "id").await?,
            transformer_name: transformer_name.to_string(),
            start_time: now(),
            end_time: None,
            content_hash: content_hash.to_string(),
            first_chunk,
            last_chunk: first_chunk,
        };
        self.store
            .write(
                vec![Row::Keyed(session.to_record()?)],
                &SessionLogRecord::schema(),
                false,
            )
            .await
            .context("Failed to open session")?;
        Ok(session)
    }

    /// Advance both records after a chunk's rows are durable
    ///
    /// Metadata is updated before the session so a crash between the two
    /// leaves the session behind, never ahead.
    pub async fn record_chunk(
        &self,
        metadata: &mut MetadataRecord,
        session: &mut SessionLogRecord,
        chunk_count: i64,
        last_chunk: i64,
    ) -> Result<()> {
        let written = now();
        let mut update = Record::new();
        update.insert("sequence_number".into(), json!(metadata.sequence_number));
        update.insert("chunk_count".into(), json!(chunk_count));
        update.insert("last_write_time".into(), json!(written));
        self.store
            .update(vec![update], &MetadataRecord::schema(), &["sequence_number"])
            .await
            .context("Failed to record chunk in metadata")?;
        metadata.chunk_count = chunk_count;
        metadata.last_write_time = Some(written.clone());

        let mut update = Record::new();
        update.insert("id".into(), json!(session.id));
        update.insert("last_chunk".into(), json!(last_chunk as f64));
        update.insert("end_time".into(), json!(written));
        self.store
            .update(vec![update], &SessionLogRecord::schema(), &["id"])
            .await
            .context("Failed to record chunk in session_log")?;
        session.last_chunk = last_chunk;
        session.end_time = Some(written);
        Ok(())
    }

    /// Mark the identity fully loaded
    pub async fn complete(&self, metadata: &mut MetadataRecord) -> Result<()> {
        let finished = now();
        let mut update = Record::new();
        update.insert("sequence_number".into(), json!(metadata.sequence_number));
        update.insert("status".into(), json!(LoadState::Complete.as_str()));
        update.insert("finish_time".into(), json!(finished));
        update.insert("last_write_time".into(), json!(finished));
        self.store
            .update(vec![update], &MetadataRecord::schema(), &["sequence_number"])
            .await
            .context("Failed to mark metadata complete")?;
        metadata.status = LoadState::Complete;
        metadata.finish_time = Some(finished.clone());
        metadata.last_write_time = Some(finished);
        Ok(())
    }

    async fn next_id(&self, table: &str, field: &str) -> Result<i64> {
        let latest = self
            .store
            .read(Selector::table(table).order_by(field, Order::Desc).limit(1).into())
            .await?
            .try_collect()
            .await
            .with_context(|| format!("Failed to read latest {}.{}", table, field))?;
        let max = latest
            .first()
            .and_then(|r| r.get(field))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(max + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, StoreConfig};
    use tempfile::TempDir;

    async fn ledger(temp: &TempDir) -> Ledger {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(StoreConfig::sqlite(
            temp.path().join("ledger.sqlite").display().to_string(),
        )));
        store.configure(&Ledger::tables(), false).await.unwrap();
        Ledger::new(store)
    }

    #[tokio::test]
    async fn test_is_complete_without_store() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(StoreConfig::sqlite(
            temp.path().join("absent.sqlite").display().to_string(),
        )));
        let ledger = Ledger::new(store);

        assert!(!ledger.is_complete("abc").await.unwrap());
        assert!(!temp.path().join("absent.sqlite").exists());
    }

    #[tokio::test]
    async fn test_begin_reuses_started_record() {
        let temp = TempDir::new().unwrap();
        let ledger = ledger(&temp).await;

        let mut first = ledger.begin("a.csv", "aaa").await.unwrap();
        assert_eq!(first.sequence_number, 1);
        let mut session = ledger.open_session("mapped_row", "aaa", 0).await.unwrap();
        ledger
            .record_chunk(&mut first, &mut session, 2, 2)
            .await
            .unwrap();

        let again = ledger.begin("a.csv", "aaa").await.unwrap();
        assert_eq!(again.sequence_number, 1);
        assert_eq!(again.chunk_count, 2);

        let other = ledger.begin("b.csv", "bbb").await.unwrap();
        assert_eq!(other.sequence_number, 2);
    }

    #[tokio::test]
    async fn test_complete_marks_identity_done() {
        let temp = TempDir::new().unwrap();
        let ledger = ledger(&temp).await;

        let mut metadata = ledger.begin("a.csv", "aaa").await.unwrap();
        assert!(!ledger.is_complete("aaa").await.unwrap());
        ledger.complete(&mut metadata).await.unwrap();

        assert!(ledger.is_complete("aaa").await.unwrap());
        let stored = ledger.find("aaa").await.unwrap().unwrap();
        assert_eq!(stored.status, LoadState::Complete);
        assert!(stored.finish_time.is_some());
    }

    #[tokio::test]
    async fn test_sessions_are_numbered() {
        let temp = TempDir::new().unwrap();
        let ledger = ledger(&temp).await;

        let mut metadata = ledger.begin("a.csv", "aaa").await.unwrap();
        let mut first = ledger.open_session("mapped_row", "aaa", 0).await.unwrap();
        ledger
            .record_chunk(&mut metadata, &mut first, 1, 1)
            .await
            .unwrap();
        let second = ledger.open_session("mapped_row", "aaa", 1).await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));

        let sessions = ledger.sessions("aaa").await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].first_chunk, 0);
        assert_eq!(sessions[0].last_chunk, 1);
        assert_eq!(sessions[1].first_chunk, 1);
        assert_eq!(sessions[1].last_chunk, 1);
    }

    #[tokio::test]
    async fn test_completed_record_restarts_when_reloaded() {
        let temp = TempDir::new().unwrap();
        let ledger = ledger(&temp).await;

        let mut metadata = ledger.begin("a.csv", "aaa").await.unwrap();
        let mut session = ledger.open_session("mapped_row", "aaa", 0).await.unwrap();
        ledger
            .record_chunk(&mut metadata, &mut session, 3, 3)
            .await
            .unwrap();
        ledger.complete(&mut metadata).await.unwrap();

        let restarted = ledger.begin("a.csv", "aaa").await.unwrap();
        assert_eq!(restarted.sequence_number, 1);
        assert_eq!(restarted.chunk_count, 0);
        assert!(!ledger.is_complete("aaa").await.unwrap());
        assert_eq!(ledger.history().await.unwrap().len(), 1);
    }
}
