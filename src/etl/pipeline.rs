//! Resumable chunked load orchestration

use super::{
    FieldMapping, RawRow, RowSource, RowTransformer, Store, TransformContext, Transformed,
    is_unreachable,
};
use crate::checkpoint::{Ledger, MetadataRecord, SessionLogRecord};
use crate::schema::{Row, TableSchema};
use crate::store::StoreConfig;
use eyre::{Context, Result, bail};
use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
pub const DEFAULT_TEST_CHUNK_SIZE: usize = 1_000;
pub const DEFAULT_TEST_LINE_LIMIT: usize = 10_000;

/// Input rows between progress lines
const PROGRESS_EVERY: usize = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    #[default]
    Production,
    /// Smaller chunks, capped input and a `test`-suffixed store
    Test,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    pub mode: LoadMode,
    /// Cell values treated as absent
    pub null_equivalents: Vec<String>,
    /// Drop and recreate the tables, loading again even if already complete
    pub force: bool,
    /// Input rows per committed chunk; defaults by mode
    pub chunk_size: Option<usize>,
    /// Input rows processed in test mode
    pub test_line_limit: usize,
    /// Abort right after the first committed chunk
    pub chaos_monkey: bool,
    /// Resume from this chunk instead of the recorded `chunk_count`
    pub skip: Option<i64>,
    /// Count the input up front so progress lines can show an ETA
    pub estimate_progress: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            mode: LoadMode::Production,
            null_equivalents: vec![String::new()],
            force: false,
            chunk_size: None,
            test_line_limit: DEFAULT_TEST_LINE_LIMIT,
            chaos_monkey: false,
            skip: None,
            estimate_progress: false,
        }
    }
}

impl LoadOptions {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(match self.mode {
            LoadMode::Production => DEFAULT_CHUNK_SIZE,
            LoadMode::Test => DEFAULT_TEST_CHUNK_SIZE,
        })
    }

    fn line_limit(&self) -> Option<usize> {
        match self.mode {
            LoadMode::Production => None,
            LoadMode::Test => Some(self.test_line_limit),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadStatus {
    Completed,
    AlreadyDone,
    ChaosMonkey,
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "Completed",
            Self::AlreadyDone => "Already done",
            Self::ChaosMonkey => "Chaos monkey invoked",
        })
    }
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Input rows consumed past the resume offset
    pub rows_read: usize,
    /// Input rows discarded below the resume offset
    pub rows_skipped: usize,
    pub records_written: usize,
    pub malformed: usize,
    /// Records dropped for repeating a primary key seen this run
    pub duplicates: usize,
    /// Records refused by the store during the final flush
    pub rejected: usize,
    pub chunks_committed: usize,
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    /// The store actually written, after test-mode renaming
    pub config: StoreConfig,
    pub status: LoadStatus,
    pub report: LoadReport,
}

/// Sequential engine that loads a row source into a store in chunks
///
/// Progress is checkpointed after every chunk, so a run interrupted at any
/// point resumes after the last committed chunk when started again with
/// the same input and chunk size.
///
/// # Example
/// ```no_run
/// use chunk_loader::etl::{ChunkedLoader, LoadOptions, MappedRowMaker};
/// use chunk_loader::storage::{CsvOptions, CsvRowSource};
/// use chunk_loader::store::StoreConfig;
///
/// # async fn example() -> eyre::Result<()> {
/// let source = CsvRowSource::new("prices.csv", CsvOptions::default());
/// let (table, mapping) = source.infer_schema("prices")?;
///
/// let loader = ChunkedLoader::new(StoreConfig::sqlite("prices.sqlite"), LoadOptions::default());
/// let outcome = loader.run(&table, &mapping, &source, &MappedRowMaker).await?;
/// println!("{}", outcome.status);
/// # Ok(())
/// # }
/// ```
pub struct ChunkedLoader {
    config: StoreConfig,
    options: LoadOptions,
}

impl ChunkedLoader {
    pub fn new(config: StoreConfig, options: LoadOptions) -> Self {
        Self { config, options }
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// The store this loader writes to once the mode is applied
    pub fn resolved_config(&self) -> StoreConfig {
        match self.options.mode {
            LoadMode::Production => self.config.clone(),
            LoadMode::Test => self.config.for_test(),
        }
    }

    /// Open the resolved store and load `source` into `table`
    pub async fn run(
        &self,
        table: &TableSchema,
        mapping: &FieldMapping,
        source: &dyn RowSource,
        transformer: &dyn RowTransformer,
    ) -> Result<LoadOutcome> {
        let store = crate::store::open(self.resolved_config())?;
        self.run_on(store, table, mapping, source, transformer).await
    }

    /// Load into an already opened store
    pub async fn run_on(
        &self,
        store: Arc<dyn Store>,
        table: &TableSchema,
        mapping: &FieldMapping,
        source: &dyn RowSource,
        transformer: &dyn RowTransformer,
    ) -> Result<LoadOutcome> {
        let chunk_size = self.options.chunk_size();
        if chunk_size == 0 {
            bail!("Chunk size must be at least 1");
        }
        let config = store.config().clone();
        let ledger = Ledger::new(store.clone());

        let content_hash = source
            .content_hash()
            .with_context(|| format!("Failed to identify {}", source.name()))?;
        log::info!(
            "Loading {} ({}) into {}",
            source.name().bright_black(),
            content_hash.chars().take(12).collect::<String>(),
            config
        );

        if !self.options.force && ledger.is_complete(&content_hash).await? {
            log::info!("{} is already loaded, nothing to do", source.name());
            return Ok(LoadOutcome {
                config,
                status: LoadStatus::AlreadyDone,
                report: LoadReport::default(),
            });
        }

        let schema = target_schema(table, mapping)?;
        let mut tables = vec![schema.clone()];
        tables.extend(Ledger::tables());
        store
            .configure(&tables, self.options.force)
            .await
            .with_context(|| format!("Failed to configure {}", config))?;

        let metadata = ledger.begin(source.name(), &content_hash).await?;
        let chunk_skip = match self.options.skip {
            Some(skip) => {
                if skip != metadata.chunk_count {
                    log::warn!(
                        "Skipping {} chunks as asked, the ledger recorded {}",
                        skip,
                        metadata.chunk_count
                    );
                }
                skip
            }
            None => metadata.chunk_count,
        };
        if chunk_skip < 0 {
            bail!("Cannot skip a negative number of chunks ({})", chunk_skip);
        }
        let offset = chunk_skip as usize * chunk_size;
        log::info!("Skipping {} chunks ({} lines)", chunk_skip, offset);

        let session = ledger
            .open_session(transformer.name(), &content_hash, chunk_skip)
            .await?;

        let total = match self.options.estimate_progress {
            true => {
                let counted = source.count_rows()?;
                log::info!("{} has {} rows", source.name(), counted);
                Some(counted)
            }
            false => None,
        };

        let mut run = ChunkRun {
            store: store.as_ref(),
            ledger: &ledger,
            schema: &schema,
            metadata,
            session,
            chunk_count: chunk_skip,
            buffer: Vec::new(),
            seen: HashSet::new(),
            report: LoadReport::default(),
            row: 0,
        };
        let ctx = TransformContext {
            schema: &schema,
            mapping,
            null_equivalents: &self.options.null_equivalents,
            autoincrement: is_autoincrement(&schema, mapping),
            primary_key: schema.primary_key(),
        };

        let status = match self
            .stream(&mut run, source, transformer, &ctx, chunk_size, offset, total)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                log::error!(
                    "Load of {} failed at input row {}: {:?}",
                    source.name(),
                    run.row,
                    e
                );
                return Err(e);
            }
        };

        if status == LoadStatus::Completed {
            run.finish().await?;
        }
        Ok(LoadOutcome {
            config,
            status,
            report: run.report,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream(
        &self,
        run: &mut ChunkRun<'_>,
        source: &dyn RowSource,
        transformer: &dyn RowTransformer,
        ctx: &TransformContext<'_>,
        chunk_size: usize,
        offset: usize,
        total: Option<usize>,
    ) -> Result<LoadStatus> {
        let limit = self.options.line_limit();
        let started = Instant::now();

        for (i, row) in source.rows()?.enumerate() {
            run.row = i;
            if limit.is_some_and(|limit| i >= limit) {
                log::info!("Reached the test line limit of {} rows", i);
                break;
            }
            if i < offset {
                row.with_context(|| format!("Failed to read input row {}", i))?;
                run.report.rows_skipped += 1;
                continue;
            }

            let row = row.with_context(|| format!("Failed to read input row {}", i))?;
            run.report.rows_read += 1;
            run.accept(&row, transformer, ctx)?;

            if run.report.rows_read % PROGRESS_EVERY == 0 {
                let expected = match (total, limit) {
                    (Some(total), Some(limit)) => Some(total.min(limit)),
                    (total, _) => total,
                };
                report_progress(i + 1, run.report.rows_read, expected, started);
            }

            if (i + 1) % chunk_size == 0 {
                run.commit_chunk().await?;
                if self.options.chaos_monkey {
                    log::error!(
                        "Chaos monkey invoked, stopping after input row {} with {} chunks committed",
                        i,
                        run.chunk_count
                    );
                    return Ok(LoadStatus::ChaosMonkey);
                }
            }
        }
        Ok(LoadStatus::Completed)
    }
}

/// Mutable state of one run, owned by the orchestrating task
struct ChunkRun<'a> {
    store: &'a dyn Store,
    ledger: &'a Ledger,
    schema: &'a TableSchema,
    metadata: MetadataRecord,
    session: SessionLogRecord,
    chunk_count: i64,
    buffer: Vec<Row>,
    seen: HashSet<String>,
    report: LoadReport,
    row: usize,
}

impl ChunkRun<'_> {
    fn accept(
        &mut self,
        row: &RawRow,
        transformer: &dyn RowTransformer,
        ctx: &TransformContext<'_>,
    ) -> Result<()> {
        let transformed = transformer.transform(row, ctx)?;
        if transformed == Transformed::Malformed {
            log::debug!("Dropped malformed input row {}: {:?}", self.row, row);
            self.report.malformed += 1;
            return Ok(());
        }

        for record in transformed.into_records() {
            if let Some(key) = ctx.primary_key
                && !ctx.autoincrement
            {
                let value = record.get(key).map(|v| v.to_string()).unwrap_or_default();
                if !self.seen.insert(value) {
                    self.report.duplicates += 1;
                    log::warn!(
                        "Lines dropped = {}, do not use resume",
                        self.report.duplicates
                    );
                    continue;
                }
            }
            self.buffer.push(Row::Keyed(record));
        }
        Ok(())
    }

    /// Write the buffer, then advance the checkpoint
    async fn commit_chunk(&mut self) -> Result<()> {
        let rows = std::mem::take(&mut self.buffer);
        let written = rows.len();
        write_chunk(self.store, self.schema, rows).await?;
        self.report.records_written += written;

        self.chunk_count += 1;
        let chunk_count = self.chunk_count;
        self.ledger
            .record_chunk(&mut self.metadata, &mut self.session, chunk_count, chunk_count)
            .await?;
        self.report.chunks_committed += 1;
        log::debug!("Committed chunk {} ({} records)", chunk_count, written);
        Ok(())
    }

    /// Flush the partial chunk and mark the identity complete
    async fn finish(&mut self) -> Result<()> {
        let rows = std::mem::take(&mut self.buffer);
        let pending = rows.len();
        log::info!("Final write of {} records", pending);
        if pending > 0 {
            let rejected = self
                .store
                .write(rows, self.schema, true)
                .await
                .with_context(|| format!("Failed final write into '{}'", self.schema.name))?;
            if !rejected.is_empty() {
                log::warn!("Store rejected {} records in the final write", rejected.len());
            }
            self.report.rejected = rejected.len();
            self.report.records_written += pending - rejected.len();
        }
        self.ledger.complete(&mut self.metadata).await?;

        let report = &self.report;
        log::info!(
            "{} {} records into '{}' ({} chunks this run)",
            "Wrote".green(),
            report.records_written,
            self.schema.name.cyan(),
            report.chunks_committed
        );
        if report.duplicates > 0 {
            log::warn!(
                "Dropped {} records with a duplicate primary key ({})",
                report.duplicates,
                self.schema.primary_key().unwrap_or_default()
            );
        }
        if report.malformed > 0 {
            log::warn!("Dropped {} malformed input rows", report.malformed);
        }
        Ok(())
    }
}

/// Batch write with a row-at-a-time retry that isolates the bad row
async fn write_chunk(store: &dyn Store, schema: &TableSchema, rows: Vec<Row>) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    match store.write(rows.clone(), schema, false).await {
        Ok(_) => Ok(()),
        Err(e) if is_unreachable(&e) => Err(e),
        Err(e) => {
            log::warn!(
                "Chunk write into '{}' failed ({}), writing row by row to find the problem",
                schema.name,
                e
            );
            for (n, row) in rows.into_iter().enumerate() {
                log::info!("{}. About to write {:?}", n, row);
                store
                    .write(vec![row], schema, false)
                    .await
                    .with_context(|| format!("Row {} of the chunk could not be written", n))?;
            }
            Ok(())
        }
    }
}

/// Copy of `table` with the primary key flagged for store assignment when unmapped
fn target_schema(table: &TableSchema, mapping: &FieldMapping) -> Result<TableSchema> {
    let mut schema = table.clone();
    if schema.fields.is_empty() {
        bail!("Table '{}' has no fields", schema.name);
    }
    let autoincrement = is_autoincrement(&schema, mapping);
    let key = schema.primary_key().map(str::to_string);
    if let Some(field) = schema
        .fields
        .iter_mut()
        .find(|f| Some(&f.name) == key.as_ref())
    {
        field.autoincrement |= autoincrement;
    }
    Ok(schema)
}

fn is_autoincrement(schema: &TableSchema, mapping: &FieldMapping) -> bool {
    match schema.primary_key() {
        Some(key) => {
            matches!(mapping.get(key), Some(None))
                || schema.field(key).is_some_and(|f| f.autoincrement)
        }
        None => false,
    }
}

fn report_progress(position: usize, processed: usize, total: Option<usize>, started: Instant) {
    let Some(total) = total else {
        log::info!("Wrote {} rows", position);
        return;
    };
    let per_row = started.elapsed().as_secs_f64() / processed.max(1) as f64;
    let remaining = total.saturating_sub(position) as f64 * per_row;
    let eta = chrono::Local::now() + chrono::Duration::milliseconds((remaining * 1000.0) as i64);
    log::info!(
        "Wrote {}/{}, estimated completion {}",
        position,
        total,
        eta.format("%Y-%m-%d %H:%M:%S").bright_black()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::{ColumnRef, FieldSource, MemoryRowSource, Selector};
    use crate::schema::{ColumnKind, FieldSpec};
    use crate::store::SqliteStore;
    use tempfile::TempDir;

    fn table() -> TableSchema {
        TableSchema::new(
            "letters",
            vec![
                FieldSpec::key("id", ColumnKind::Integer),
                FieldSpec::new("letter", ColumnKind::Text),
            ],
        )
    }

    fn mapping(key: Option<usize>) -> FieldMapping {
        let mut mapping = FieldMapping::new();
        mapping.insert(
            "id".into(),
            key.map(|i| FieldSource::Column(ColumnRef::Index(i))),
        );
        mapping.insert(
            "letter".into(),
            Some(FieldSource::Column(ColumnRef::Index(1))),
        );
        mapping
    }

    fn source(rows: &[(&str, &str)]) -> MemoryRowSource {
        MemoryRowSource::new(
            "letters.csv",
            rows.iter()
                .map(|(a, b)| RawRow::positional([*a, *b]))
                .collect(),
        )
    }

    #[test]
    fn test_chunk_size_defaults_by_mode() {
        let mut options = LoadOptions::default();
        assert_eq!(options.chunk_size(), DEFAULT_CHUNK_SIZE);
        options.mode = LoadMode::Test;
        assert_eq!(options.chunk_size(), DEFAULT_TEST_CHUNK_SIZE);
        options.chunk_size = Some(7);
        assert_eq!(options.chunk_size(), 7);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(LoadStatus::Completed.to_string(), "Completed");
        assert_eq!(LoadStatus::AlreadyDone.to_string(), "Already done");
        assert_eq!(LoadStatus::ChaosMonkey.to_string(), "Chaos monkey invoked");
    }

    #[test]
    fn test_unmapped_key_is_autoincrement() {
        let schema = target_schema(&table(), &mapping(None)).unwrap();
        assert!(schema.field("id").unwrap().autoincrement);
        assert!(is_autoincrement(&schema, &mapping(None)));

        let schema = target_schema(&table(), &mapping(Some(0))).unwrap();
        assert!(!schema.field("id").unwrap().autoincrement);
    }

    #[test]
    fn test_test_mode_renames_store() {
        let loader = ChunkedLoader::new(
            StoreConfig::sqlite("out/data.sqlite"),
            LoadOptions {
                mode: LoadMode::Test,
                ..Default::default()
            },
        );
        assert_eq!(loader.resolved_config().name, "out/data-test.sqlite");
    }

    #[tokio::test]
    async fn test_synthetic_keys_are_not_deduplicated() {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig::sqlite(temp.path().join("a.sqlite").display().to_string());
        let loader = ChunkedLoader::new(
            config.clone(),
            LoadOptions {
                chunk_size: Some(2),
                ..Default::default()
            },
        );

        let outcome = loader
            .run(
                &table(),
                &mapping(None),
                &source(&[("1", "A"), ("1", "B"), ("1", "C")]),
                &crate::etl::MappedRowMaker,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, LoadStatus::Completed);
        assert_eq!(outcome.report.duplicates, 0);
        assert_eq!(outcome.report.records_written, 3);
        assert_eq!(outcome.report.chunks_committed, 1);
    }

    #[tokio::test]
    async fn test_test_mode_caps_input() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(StoreConfig::sqlite(
            temp.path().join("t-test.sqlite").display().to_string(),
        )));
        let loader = ChunkedLoader::new(
            store.config().clone(),
            LoadOptions {
                mode: LoadMode::Test,
                test_line_limit: 2,
                ..Default::default()
            },
        );
        let outcome = loader
            .run_on(
                store,
                &table(),
                &mapping(Some(0)),
                &source(&[("1", "A"), ("2", "B"), ("3", "C")]),
                &crate::etl::MappedRowMaker,
            )
            .await
            .unwrap();

        assert_eq!(outcome.report.rows_read, 2);
        assert_eq!(outcome.report.records_written, 2);
    }

    async fn seeded_store(temp: &TempDir, id: i64) -> Arc<dyn Store> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(StoreConfig::sqlite(
            temp.path().join("seeded.sqlite").display().to_string(),
        )));
        store.configure(&[table()], false).await.unwrap();
        let mut record = crate::schema::Record::new();
        record.insert("id".into(), serde_json::json!(id));
        record.insert("letter".into(), serde_json::json!("Z"));
        store
            .write(vec![Row::Keyed(record)], &table(), false)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_failed_chunk_is_retried_row_by_row() {
        let temp = TempDir::new().unwrap();
        let store = seeded_store(&temp, 2).await;
        let loader = ChunkedLoader::new(
            store.config().clone(),
            LoadOptions {
                chunk_size: Some(3),
                ..Default::default()
            },
        );

        let err = loader
            .run_on(
                store.clone(),
                &table(),
                &mapping(Some(0)),
                &source(&[("1", "A"), ("2", "B"), ("3", "C")]),
                &crate::etl::MappedRowMaker,
            )
            .await
            .unwrap_err();
        assert!(format!("{:?}", err).contains("Row 1 of the chunk"));

        // Row 0 went in before the offending row stopped the load
        let letters = store
            .read(Selector::table("letters").into())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(letters.len(), 2);
    }

    #[tokio::test]
    async fn test_final_flush_tolerates_rejections() {
        let temp = TempDir::new().unwrap();
        let store = seeded_store(&temp, 3).await;
        let loader = ChunkedLoader::new(
            store.config().clone(),
            LoadOptions {
                chunk_size: Some(10),
                estimate_progress: true,
                ..Default::default()
            },
        );

        let outcome = loader
            .run_on(
                store,
                &table(),
                &mapping(Some(0)),
                &source(&[("1", "A"), ("2", "B"), ("3", "C")]),
                &crate::etl::MappedRowMaker,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, LoadStatus::Completed);
        assert_eq!(outcome.report.rejected, 1);
        assert_eq!(outcome.report.records_written, 2);
        assert_eq!(outcome.report.chunks_committed, 0);
    }
}
