//! Parallel chunk construction with a persisted chunk ledger
//!
//! Rows are built per key on a bounded pool of blocking workers. The
//! orchestrating task alone writes to the store: each completed chunk is
//! written, the checkpoint advanced, and only then is the chunk removed from
//! `chunk_log`. Whatever remains in `chunk_log` after a crash is the work
//! left to do.

use super::{LoadOutcome, LoadReport, LoadStatus, Selector, Store};
use crate::checkpoint::{ChunkLedger, ChunkLedgerEntry, Ledger};
use crate::schema::{Record, Row, TableSchema};
use crate::storage::hash_bytes;
use eyre::{Context, Result, bail};
use owo_colors::OwoColorize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

pub const DEFAULT_PARALLEL_CHUNK_SIZE: usize = 1_000;

/// Two-part key a row is built from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub part_1: String,
    pub part_2: Option<String>,
}

impl RowKey {
    pub fn new(part_1: impl Into<String>) -> Self {
        Self {
            part_1: part_1.into(),
            part_2: None,
        }
    }

    pub fn pair(part_1: impl Into<String>, part_2: impl Into<String>) -> Self {
        Self {
            part_1: part_1.into(),
            part_2: Some(part_2.into()),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.part_1.trim().is_empty()
    }
}

/// Supplies the keys to build, already split into chunks
pub trait KeySource: Send + Sync {
    fn name(&self) -> &str;

    /// Chunks must come back in the same order on every call
    fn key_chunks(&self, chunk_size: usize) -> Result<Vec<Vec<RowKey>>>;
}

/// Builds the target records for one key
pub trait RowBuilder: Send + Sync + 'static {
    /// Recorded in the session log as `transformer_name`
    fn name(&self) -> &str;

    /// Records for `key`; an empty list is fine, an error fails the run
    fn build(&self, key: &RowKey) -> Result<Vec<Record>>;
}

/// Keys held in memory
#[derive(Debug, Clone)]
pub struct MemoryKeySource {
    name: String,
    keys: Vec<RowKey>,
}

impl MemoryKeySource {
    pub fn new(name: impl Into<String>, keys: Vec<RowKey>) -> Self {
        Self {
            name: name.into(),
            keys,
        }
    }
}

impl KeySource for MemoryKeySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_chunks(&self, chunk_size: usize) -> Result<Vec<Vec<RowKey>>> {
        Ok(self
            .keys
            .chunks(chunk_size.max(1))
            .map(<[RowKey]>::to_vec)
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelOptions {
    pub chunk_size: usize,
    /// Chunks built concurrently
    pub workers: usize,
    /// Drop and rebuild everything, even a completed build
    pub force: bool,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_PARALLEL_CHUNK_SIZE,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            force: false,
        }
    }
}

struct BuiltChunk {
    chunk_number: i64,
    records: Vec<Record>,
    keys: usize,
    blank: usize,
}

fn build_chunk(builder: &dyn RowBuilder, chunk_number: i64, keys: Vec<RowKey>) -> Result<BuiltChunk> {
    let mut records = Vec::new();
    let mut blank = 0;
    for key in &keys {
        if key.is_blank() {
            log::debug!("Skipping blank key in chunk {}", chunk_number);
            blank += 1;
            continue;
        }
        records.extend(
            builder
                .build(key)
                .with_context(|| format!("Failed to build rows for key {:?}", key))?,
        );
    }
    Ok(BuiltChunk {
        chunk_number,
        records,
        keys: keys.len(),
        blank,
    })
}

/// Identity of a build: the key source paired with the row builder
pub fn build_identity(keys: &dyn KeySource, builder: &dyn RowBuilder) -> String {
    hash_bytes(format!("{}\n{}", keys.name(), builder.name()).as_bytes())
}

/// Builds a table from keys on a worker pool, resumable per chunk
pub struct ParallelBuilder {
    store: Arc<dyn Store>,
    options: ParallelOptions,
}

impl ParallelBuilder {
    pub fn new(store: Arc<dyn Store>, options: ParallelOptions) -> Self {
        Self { store, options }
    }

    pub async fn run(
        &self,
        table: &TableSchema,
        keys: &dyn KeySource,
        builder: Arc<dyn RowBuilder>,
    ) -> Result<LoadOutcome> {
        let chunk_size = self.options.chunk_size;
        if chunk_size == 0 {
            bail!("Chunk size must be at least 1");
        }
        let config = self.store.config().clone();
        let ledger = Ledger::new(self.store.clone());
        let chunk_ledger = ChunkLedger::new(self.store.clone());
        let identity = build_identity(keys, builder.as_ref());

        if !self.options.force && ledger.is_complete(&identity).await? {
            log::info!(
                "{} already built from {}, nothing to do",
                builder.name(),
                keys.name()
            );
            return Ok(LoadOutcome {
                config,
                status: LoadStatus::AlreadyDone,
                report: LoadReport::default(),
            });
        }

        let mut tables = vec![table.clone(), ChunkLedger::schema()];
        tables.extend(Ledger::tables());
        self.store
            .configure(&tables, self.options.force)
            .await
            .with_context(|| format!("Failed to configure {}", config))?;

        let mut metadata = ledger.begin(keys.name(), &identity).await?;
        let mut key_chunks = keys
            .key_chunks(chunk_size)
            .with_context(|| format!("Failed to read keys from {}", keys.name()))?;
        let n_chunks = key_chunks.len() as i64;
        log::info!("{} yields {} chunks", keys.name().bright_black(), n_chunks);

        // Chunks can commit without producing rows, so an empty table alone
        // does not mean nothing was done
        let resume = metadata.chunk_count > 0 || self.has_output(table).await?;
        let todo = if resume {
            chunk_ledger.remaining().await?
        } else {
            chunk_ledger.clear().await?;
            let entries = key_chunks
                .iter()
                .enumerate()
                .map(|(i, chunk)| ChunkLedgerEntry {
                    chunk_number: i as i64,
                    start_key_part_1: chunk.first().map(|k| k.part_1.clone()),
                    start_key_part_2: chunk.first().and_then(|k| k.part_2.clone()),
                })
                .collect();
            chunk_ledger.generate(entries).await?;
            (0..n_chunks).collect()
        };
        let chunk_skip = n_chunks - todo.len() as i64;
        log::info!(
            "{} chunks will be skipped because they've been done already",
            chunk_skip
        );

        let mut session = ledger
            .open_session(builder.name(), &identity, chunk_skip)
            .await?;

        let todo_set: HashSet<i64> = todo.iter().copied().collect();
        let mut pending = key_chunks
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| todo_set.contains(&(*i as i64)))
            .map(|(i, chunk)| (i as i64, std::mem::take(chunk)))
            .collect::<Vec<_>>()
            .into_iter();
        let n_todo = todo_set.len();

        let mut workers = JoinSet::new();
        let dispatch = |workers: &mut JoinSet<Result<BuiltChunk>>, (chunk_number, chunk): (i64, Vec<RowKey>)| {
            let builder = builder.clone();
            log::debug!(
                "Dispatching chunk {} starting at {:?}",
                chunk_number,
                chunk.first().map(|k| &k.part_1)
            );
            workers.spawn_blocking(move || build_chunk(builder.as_ref(), chunk_number, chunk));
        };
        for next in pending.by_ref().take(self.options.workers.max(1)) {
            dispatch(&mut workers, next);
        }

        let started = Instant::now();
        let mut report = LoadReport {
            rows_skipped: chunk_skip as usize * chunk_size,
            ..Default::default()
        };
        let mut received: i64 = 0;
        while let Some(joined) = workers.join_next().await {
            let built = joined.context("Chunk worker panicked")??;
            let written = built.records.len();
            if written > 0 {
                let rows = built.records.into_iter().map(Row::Keyed).collect();
                self.store
                    .write(rows, table, false)
                    .await
                    .with_context(|| format!("Failed to write chunk {}", built.chunk_number))?;
            }
            received += 1;
            let committed = (received + chunk_skip).max(metadata.chunk_count);
            ledger
                .record_chunk(&mut metadata, &mut session, committed, committed)
                .await?;
            chunk_ledger.remove(built.chunk_number).await?;

            report.rows_read += built.keys;
            report.malformed += built.blank;
            report.records_written += written;
            report.chunks_committed += 1;

            let per_chunk = started.elapsed().as_secs_f64() / received as f64;
            let remaining = (n_todo as i64 - received).max(0) as f64 * per_chunk;
            let eta = chrono::Local::now()
                + chrono::Duration::milliseconds((remaining * 1000.0) as i64);
            log::info!(
                "{}: {}/{}, estimated completion {}",
                builder.name(),
                received,
                n_todo,
                eta.format("%Y-%m-%d %H:%M:%S").bright_black()
            );

            if let Some(next) = pending.next() {
                dispatch(&mut workers, next);
            }
        }

        ledger.complete(&mut metadata).await?;
        log::info!(
            "{} {} records into '{}' with {}",
            "Wrote".green(),
            report.records_written,
            table.name.cyan(),
            builder.name()
        );
        Ok(LoadOutcome {
            config,
            status: LoadStatus::Completed,
            report,
        })
    }

    async fn has_output(&self, table: &TableSchema) -> Result<bool> {
        let sample = self
            .store
            .read(Selector::table(&table.name).limit(1).into())
            .await?
            .try_collect()
            .await
            .with_context(|| format!("Failed to sample '{}'", table.name))?;
        Ok(!sample.is_empty())
    }
}
