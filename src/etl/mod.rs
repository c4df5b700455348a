//! Core load engine
//!
//! Rows flow from a [`RowSource`] through a [`RowTransformer`] into a
//! [`Store`], one chunk at a time. The sequential [`ChunkedLoader`] and the
//! [`ParallelBuilder`] share the same checkpoint protocol.

mod extract;
mod load;
mod parallel;
mod pipeline;
mod transform;

pub use extract::{MemoryRowSource, RawRow, RowIter, RowSource};
pub use load::{
    Order, Query, RecordStream, Selector, Store, StoreError, is_constraint, is_unreachable,
    retry_unreachable,
};
pub use parallel::{
    DEFAULT_PARALLEL_CHUNK_SIZE, KeySource, MemoryKeySource, ParallelBuilder, ParallelOptions,
    RowBuilder, RowKey, build_identity,
};
pub use pipeline::{
    ChunkedLoader, DEFAULT_CHUNK_SIZE, DEFAULT_TEST_CHUNK_SIZE, DEFAULT_TEST_LINE_LIMIT,
    LoadMode, LoadOptions, LoadOutcome, LoadReport, LoadStatus,
};
pub use transform::{
    ColumnRef, FieldMapping, FieldSource, MappedRowMaker, RowTransformer, TransformContext,
    TransformError, Transformed, make_point,
};
