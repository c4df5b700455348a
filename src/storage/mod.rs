//! File system access for row sources
//!
//! This module handles reading input files:
//! - Plain files and zip archive members
//! - Content hashing for input identity
//! - Delimited text and NDJSON row sources

mod archive;
mod delimited;
mod hash;
mod ndjson;

pub use archive::{SourceLocation, read_member};
pub use delimited::{CsvOptions, CsvRowSource, Encoding};
pub use hash::{hash_bytes, hash_location, hash_reader};
pub use ndjson::NdjsonRowSource;
