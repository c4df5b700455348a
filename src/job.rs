//! YAML job files describing one load

use crate::etl::{FieldMapping, FieldSource, LoadMode, LoadOptions, RowSource};
use crate::schema::TableSchema;
use crate::storage::{CsvOptions, CsvRowSource, Encoding, NdjsonRowSource};
use crate::store::{StoreConfig, StoreSpec};
use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    #[default]
    Csv,
    Ndjson,
}

fn default_true() -> bool {
    true
}

fn default_delimiter() -> String {
    ",".to_string()
}

/// Where the input lives and how to read it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// A file, or `archive.zip/member` inside a zip
    pub path: String,
    #[serde(default)]
    pub format: SourceFormat,
    #[serde(default = "default_true")]
    pub headers: bool,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub encoding: Encoding,
}

impl SourceSpec {
    pub fn csv(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            format: SourceFormat::Csv,
            headers: true,
            delimiter: default_delimiter(),
            encoding: Encoding::Utf8,
        }
    }

    fn delimiter_byte(&self) -> Result<u8> {
        match self.delimiter.as_str() {
            "\\t" | "tab" => Ok(b'\t'),
            d if d.len() == 1 => Ok(d.as_bytes()[0]),
            d => bail!("Delimiter must be a single ASCII character, got '{}'", d),
        }
    }

    pub fn csv_options(&self) -> Result<CsvOptions> {
        Ok(CsvOptions {
            headers: self.headers,
            delimiter: self.delimiter_byte()?,
            encoding: self.encoding,
        })
    }

    pub fn open(&self) -> Result<Box<dyn RowSource>> {
        Ok(match self.format {
            SourceFormat::Csv => Box::new(CsvRowSource::new(&self.path, self.csv_options()?)),
            SourceFormat::Ndjson => Box::new(NdjsonRowSource::new(&self.path)),
        })
    }
}

fn default_null_equivalents() -> Vec<String> {
    vec![String::new()]
}

/// Everything needed to run one load
///
/// ```yaml
/// store: out/prices.sqlite
/// source:
///   path: data/pp-2019.zip/pp-2019.csv
///   headers: false
/// table:
///   name: prices
///   fields:
///     - { name: id, kind: TEXT, primary_key: true }
///     - { name: price, kind: INTEGER }
/// mapping:
///   id: 0
///   price: 1
/// chunk_size: 10000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadJob {
    pub store: StoreSpec,
    pub source: SourceSpec,
    pub table: TableSchema,
    pub mapping: FieldMapping,
    #[serde(default)]
    pub mode: LoadMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(default = "default_null_equivalents")]
    pub null_equivalents: Vec<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub chaos_monkey: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<i64>,
    #[serde(default)]
    pub estimate_progress: bool,
}

impl LoadJob {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file: {}", path.display()))?;
        let job: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse job file: {}", path.display()))?;
        job.validate()?;
        Ok(job)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self).context("Failed to serialize job to YAML")?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write job file: {}", path.display()))
    }

    /// Every field needs a mapping entry and every entry a field
    pub fn validate(&self) -> Result<()> {
        for field in &self.table.fields {
            if !self.mapping.contains_key(&field.name) {
                bail!(
                    "Field '{}' of table '{}' has no mapping (use null to leave it unset)",
                    field.name,
                    self.table.name
                );
            }
        }
        for (name, source) in &self.mapping {
            let Some(field) = self.table.field(name) else {
                bail!("Mapping names '{}', which is not a field of '{}'", name, self.table.name);
            };
            if matches!(source, Some(FieldSource::Pair(_)))
                && field.kind != crate::schema::ColumnKind::Point
            {
                bail!("Only POINT fields can map a coordinate pair, '{}' is {:?}", name, field.kind);
            }
        }
        if self.chunk_size == Some(0) {
            bail!("chunk_size must be at least 1");
        }
        self.source.delimiter_byte()?;
        Ok(())
    }

    pub fn store_config(&self) -> Result<StoreConfig> {
        self.store.clone().normalise()
    }

    pub fn options(&self) -> LoadOptions {
        LoadOptions {
            mode: self.mode,
            null_equivalents: self.null_equivalents.clone(),
            force: self.force,
            chunk_size: self.chunk_size,
            chaos_monkey: self.chaos_monkey,
            skip: self.skip,
            estimate_progress: self.estimate_progress,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::ColumnRef;
    use crate::schema::ColumnKind;
    use crate::store::BackendKind;
    use tempfile::TempDir;

    const JOB: &str = r#"
store: out/prices.sqlite
source:
  path: data/pp.zip/pp.csv
  headers: false
  delimiter: "|"
  encoding: latin-1
table:
  name: prices
  fields:
    - { name: id, kind: TEXT, primary_key: true }
    - { name: price, kind: INTEGER }
    - { name: location, kind: POINT }
    - { name: note, kind: TEXT }
mapping:
  id: 0
  price: 1
  location: [5, 6]
  note: null
mode: test
chunk_size: 50
"#;

    #[test]
    fn test_parse_job() {
        let job: LoadJob = serde_yaml::from_str(JOB).unwrap();
        job.validate().unwrap();

        assert_eq!(job.mode, LoadMode::Test);
        assert_eq!(job.null_equivalents, vec![String::new()]);
        assert_eq!(job.store_config().unwrap().backend, BackendKind::Sqlite);
        assert_eq!(
            job.mapping["location"],
            Some(FieldSource::Pair([ColumnRef::Index(5), ColumnRef::Index(6)]))
        );
        assert_eq!(job.mapping["note"], None);

        let csv = job.source.csv_options().unwrap();
        assert_eq!(csv.delimiter, b'|');
        assert_eq!(csv.encoding, Encoding::Latin1);
        assert!(!csv.headers);

        let options = job.options();
        assert_eq!(options.chunk_size(), 50);
        assert!(!options.force);
    }

    #[test]
    fn test_unmapped_field_is_rejected() {
        let mut job: LoadJob = serde_yaml::from_str(JOB).unwrap();
        job.mapping.remove("price");
        let err = job.validate().unwrap_err();
        assert!(err.to_string().contains("price"));
    }

    #[test]
    fn test_pair_needs_point_field() {
        let mut job: LoadJob = serde_yaml::from_str(JOB).unwrap();
        job.table.fields[1].kind = ColumnKind::Integer;
        job.mapping.insert(
            "price".into(),
            Some(FieldSource::Pair([ColumnRef::Index(1), ColumnRef::Index(2)])),
        );
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_tab_delimiter() {
        let mut source = SourceSpec::csv("a.tsv");
        source.delimiter = "\\t".into();
        assert_eq!(source.csv_options().unwrap().delimiter, b'\t');
        source.delimiter = "ab".into();
        assert!(source.csv_options().is_err());
    }

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("jobs/prices.yml");
        let job: LoadJob = serde_yaml::from_str(JOB).unwrap();
        job.write(&path).unwrap();

        assert_eq!(LoadJob::read(&path).unwrap(), job);
    }
}
