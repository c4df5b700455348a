use chunk_loader::cli::{LoadOverrides, hash_source, init_job, run_load, show_status};
use chunk_loader::etl::LoadStatus;
use clap::{Parser, Subcommand, builder::styling};
use eyre::{Context, Result};
use owo_colors::OwoColorize;
use std::path::Path;

// CLI Styling
const STYLES: styling::Styles = styling::Styles::styled()
    .header(styling::AnsiColor::BrightWhite.on_default())
    .usage(styling::AnsiColor::BrightWhite.on_default())
    .literal(styling::AnsiColor::Green.on_default())
    .placeholder(styling::AnsiColor::Cyan.on_default());

/// Chunk Loader: resumable, chunked loading of large delimited files into SQLite or Elasticsearch
#[derive(Parser)]
#[command(name = "chunkload", version, styles = STYLES)]
struct Cli {
    /// The dotenv file to source credentials from
    #[arg(short, long, global = true, default_value = ".env")]
    env: String,

    /// More verbose logging
    #[arg(long, global = true)]
    debug: bool,

    /// Command to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the input a job file describes, resuming where a previous run stopped
    Load {
        /// The YAML job file
        #[arg(default_value = "job.yml")]
        job: String,

        /// Drop the tables and load again, even if already complete
        #[arg(short, long)]
        force: bool,

        /// Test mode: small chunks, capped input, and a "-test" store
        #[arg(short, long)]
        test: bool,

        /// Abort after the first committed chunk to exercise resumption
        #[arg(long)]
        chaos: bool,

        /// Resume from this chunk instead of the recorded progress
        #[arg(long)]
        skip: Option<i64>,

        /// Input rows per chunk, overriding the job file
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Show the loads recorded in a job's store
    Status {
        /// The YAML job file
        #[arg(default_value = "job.yml")]
        job: String,

        /// Look at the "-test" store
        #[arg(short, long)]
        test: bool,
    },

    /// Print the content hash that identifies an input file or archive member
    Hash {
        /// A file, or archive.zip/member
        path: String,
    },

    /// Write a starter job file from a CSV header row
    Init {
        /// A CSV file with a header row, or archive.zip/member.csv
        csv: String,

        /// The job file to generate
        #[arg(default_value = "job.yml")]
        job_out: String,

        /// SQLite file to load into, defaults to <csv name>.sqlite
        #[arg(short, long)]
        store: Option<String>,

        /// Destination table name
        #[arg(long)]
        table: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if Path::new(&cli.env).is_file() {
        dotenvy::from_filename(&cli.env)
            .with_context(|| format!("Failed to read dotenv file {}", cli.env))?;
    }

    let log_level = match cli.debug {
        true => "debug",
        false => "info",
    };
    let env = env_logger::Env::default().filter_or("LOG_LEVEL", log_level);
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .init();

    match cli.command {
        Commands::Load {
            job,
            force,
            test,
            chaos,
            skip,
            chunk_size,
        } => {
            let overrides = LoadOverrides {
                force,
                test,
                chaos_monkey: chaos,
                skip,
                chunk_size,
            };
            let outcome = run_load(&job, &overrides).await?;
            if outcome.status == LoadStatus::ChaosMonkey {
                std::process::exit(3);
            }
        }
        Commands::Status { job, test } => {
            show_status(&job, test).await?;
        }
        Commands::Hash { path } => {
            let hash = hash_source(&path)?;
            println!("{}  {}", hash, path.bright_black());
        }
        Commands::Init {
            csv,
            job_out,
            store,
            table,
        } => {
            log::info!(
                "Initializing {} from {}",
                job_out.bright_black(),
                csv.bright_black()
            );
            init_job(&csv, &job_out, store, table)?;
        }
    }

    Ok(())
}
