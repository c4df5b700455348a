//! NDJSON (Newline Delimited JSON) row source

use super::{SourceLocation, hash_location};
use crate::etl::{RawRow, RowIter, RowSource};

use eyre::{Context, Result, bail};
use serde_json::Value;
use std::io::{BufRead, BufReader};

/// Read NDJSON objects as named rows
///
/// Scalar values are passed on in their JSON text form, `null` becomes an
/// absent value, and nested objects or arrays are kept as compact JSON.
pub struct NdjsonRowSource {
    location: SourceLocation,
    name: String,
}

impl NdjsonRowSource {
    pub fn new(path: &str) -> Self {
        Self {
            location: SourceLocation::parse(path),
            name: path.to_string(),
        }
    }
}

fn cell(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn parse_line(line: &str) -> Result<RawRow> {
    let value: Value = serde_json::from_str(line)
        .with_context(|| format!("Failed to parse JSON line: {}", line))?;
    let Value::Object(object) = value else {
        bail!("Expected a JSON object per line, found: {}", line);
    };
    Ok(RawRow::Named(
        object.into_iter().map(|(k, v)| (k, cell(v))).collect(),
    ))
}

impl RowSource for NdjsonRowSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn content_hash(&self) -> Result<String> {
        if !self.location.exists() {
            log::warn!(
                "{} not found on disk, using its name as the content hash",
                self.name
            );
            return Ok(self.name.clone());
        }
        hash_location(&self.location)
    }

    fn rows(&self) -> Result<RowIter<'_>> {
        let reader = BufReader::new(self.location.open()?);
        Ok(Box::new(reader.lines().filter_map(|line| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(parse_line(&line)),
            Err(e) => Some(Err(e).context("Failed to read NDJSON line")),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_objects() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(
            temp.path(),
            "{\"id\": 1, \"letter\": \"A\", \"tags\": [1]}\n\n{\"id\": 2, \"letter\": null}\n",
        )
        .unwrap();

        let source = NdjsonRowSource::new(&temp.path().display().to_string());
        let rows: Vec<_> = source.rows().unwrap().collect::<Result<_>>().unwrap();

        assert_eq!(rows.len(), 2);
        let RawRow::Named(first) = &rows[0] else {
            panic!("expected named row");
        };
        assert_eq!(first["id"].as_deref(), Some("1"));
        assert_eq!(first["tags"].as_deref(), Some("[1]"));
        let RawRow::Named(second) = &rows[1] else {
            panic!("expected named row");
        };
        assert_eq!(second["letter"], None);
    }

    #[test]
    fn test_non_object_line_is_an_error() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), "[1, 2]\n").unwrap();

        let source = NdjsonRowSource::new(&temp.path().display().to_string());
        let mut rows = source.rows().unwrap();
        assert!(rows.next().unwrap().is_err());
    }
}
