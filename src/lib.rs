//! Chunk Loader
//!
//! Resumable, chunked loading of large input files into SQLite or
//! Elasticsearch, with a checkpoint ledger kept beside the data

pub mod checkpoint;
pub mod cli;
pub mod client;
pub mod etl;
pub mod job;
pub mod schema;
pub mod storage;
pub mod store;

// Re-exports for convenience
pub use checkpoint::{Ledger, LoadState, MetadataRecord, SessionLogRecord};
pub use etl::{
    ChunkedLoader, LoadMode, LoadOptions, LoadOutcome, LoadStatus, MappedRowMaker,
    ParallelBuilder, RowSource, RowTransformer, Store,
};
pub use job::LoadJob;
pub use schema::{ColumnKind, FieldSpec, Record, Row, TableSchema};
pub use store::{StoreConfig, StoreSpec};
