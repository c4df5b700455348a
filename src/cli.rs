//! CLI helper functions

use crate::{
    checkpoint::{Ledger, MetadataRecord},
    etl::{ChunkedLoader, LoadMode, LoadOutcome, LoadStatus, MappedRowMaker},
    job::{LoadJob, SourceSpec},
    schema::DEFAULT_TABLE,
    storage::{CsvRowSource, SourceLocation, hash_location},
    store::{StoreSpec, open},
};
use eyre::{Context, Result, bail};
use owo_colors::OwoColorize;
use std::path::Path;

/// Command-line switches layered over a job file
#[derive(Debug, Clone, Default)]
pub struct LoadOverrides {
    pub force: bool,
    pub test: bool,
    pub chaos_monkey: bool,
    pub skip: Option<i64>,
    pub chunk_size: Option<usize>,
}

impl LoadOverrides {
    fn apply(&self, job: &mut LoadJob) {
        job.force |= self.force;
        job.chaos_monkey |= self.chaos_monkey;
        if self.test {
            job.mode = LoadMode::Test;
        }
        if self.skip.is_some() {
            job.skip = self.skip;
        }
        if self.chunk_size.is_some() {
            job.chunk_size = self.chunk_size;
        }
    }
}

/// Run the load a job file describes
///
/// Pipeline: RowSource → MappedRowMaker → Store, checkpointed per chunk
pub async fn run_load(job_path: impl AsRef<Path>, overrides: &LoadOverrides) -> Result<LoadOutcome> {
    let job_path = job_path.as_ref();
    log::info!("Reading job {}", job_path.display().bright_black());
    let mut job = LoadJob::read(job_path)?;
    overrides.apply(&mut job);

    let config = job.store_config()?;
    let source = job.source.open()?;
    let loader = ChunkedLoader::new(config, job.options());

    let outcome = loader
        .run(&job.table, &job.mapping, source.as_ref(), &MappedRowMaker)
        .await
        .with_context(|| format!("Load of {} failed", job.source.path))?;

    let report = &outcome.report;
    match outcome.status {
        LoadStatus::Completed => log::info!(
            "✓ {} {}: {} records written, {} rows skipped, {} malformed, {} duplicates",
            outcome.status.green(),
            outcome.config,
            report.records_written,
            report.rows_skipped,
            report.malformed,
            report.duplicates
        ),
        LoadStatus::AlreadyDone => log::info!("✓ {} ({})", outcome.status.green(), outcome.config),
        LoadStatus::ChaosMonkey => log::warn!(
            "{} after {} chunks, run again to resume",
            outcome.status.yellow(),
            report.chunks_committed
        ),
    }
    Ok(outcome)
}

/// Show the load history recorded in a job's store
pub async fn show_status(job_path: impl AsRef<Path>, test: bool) -> Result<Vec<MetadataRecord>> {
    let mut job = LoadJob::read(job_path.as_ref())?;
    if test {
        job.mode = LoadMode::Test;
    }
    let loader = ChunkedLoader::new(job.store_config()?, job.options());
    let config = loader.resolved_config();
    let ledger = Ledger::new(open(config.clone())?);

    let history = ledger.history().await?;
    if history.is_empty() {
        log::info!("No loads recorded in {}", config);
        return Ok(history);
    }

    let current = job.source.open()?.content_hash()?;
    log::info!("Loads recorded in {}:", config);
    for record in &history {
        let status = match record.is_complete() {
            true => record.status.as_str().green().to_string(),
            false => record.status.as_str().yellow().to_string(),
        };
        log::info!(
            "  #{} {} {} chunks={} started={} finished={}{}",
            record.sequence_number,
            status,
            record.data_path.bright_black(),
            record.chunk_count,
            record.start_time.as_deref().unwrap_or("-"),
            record.finish_time.as_deref().unwrap_or("-"),
            match record.content_hash == current {
                true => " (this job's input)".cyan().to_string(),
                false => String::new(),
            }
        );
        for session in ledger.sessions(&record.content_hash).await? {
            log::debug!(
                "    session {} {} chunks {}..{} {} → {}",
                session.id,
                session.transformer_name,
                session.first_chunk,
                session.last_chunk,
                session.start_time,
                session.end_time.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(history)
}

/// Content hash used to recognise an input across runs
pub fn hash_source(path: &str) -> Result<String> {
    let location = SourceLocation::parse(path);
    if !location.exists() {
        bail!("{} not found", path);
    }
    hash_location(&location)
}

/// Write a starter job for a delimited file with a header row
///
/// Every column becomes a TEXT field mapped by header name; edit the job to
/// pick a primary key and tighten the column kinds.
pub fn init_job(
    source_path: &str,
    job_out: impl AsRef<Path>,
    store: Option<String>,
    table: Option<String>,
) -> Result<LoadJob> {
    let job_out = job_out.as_ref();
    if job_out.exists() {
        bail!("{} already exists, not overwriting it", job_out.display());
    }

    let source = SourceSpec::csv(source_path);
    let reader = CsvRowSource::new(source_path, source.csv_options()?);
    let table = table.unwrap_or_else(|| DEFAULT_TABLE.to_string());
    let (table, mapping) = reader.infer_schema(&table)?;
    log::info!(
        "Inferred {} fields from {}",
        table.fields.len(),
        source_path.bright_black()
    );

    let store = store.unwrap_or_else(|| {
        let stem = reader
            .location()
            .disk_path()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("data")
            .to_string();
        format!("{}.sqlite", stem)
    });

    let job = LoadJob {
        store: StoreSpec::Path(store),
        source,
        table,
        mapping,
        mode: LoadMode::Production,
        chunk_size: None,
        null_equivalents: vec![String::new()],
        force: false,
        chaos_monkey: false,
        skip: None,
        estimate_progress: false,
    };
    job.write(job_out)?;
    log::info!("✓ Wrote job {}", job_out.display());
    Ok(job)
}
