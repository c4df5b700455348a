//! Delimited text input (CSV, pipe-separated, tab-separated)

use super::{SourceLocation, hash_location};
use crate::etl::{ColumnRef, FieldMapping, FieldSource, RawRow, RowIter, RowSource};
use crate::schema::{ColumnKind, FieldSpec, TableSchema};
use eyre::{Context, Result, bail, eyre};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::str::FromStr;

/// Character encodings accepted for delimited input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Encoding {
    /// UTF-8, with or without a byte order mark
    #[default]
    Utf8,
    /// ISO-8859-1; every byte is one character
    Latin1,
}

impl FromStr for Encoding {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" | "utf-8-sig" => Ok(Self::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(Self::Latin1),
            other => bail!("Unsupported encoding '{}'", other),
        }
    }
}

impl TryFrom<String> for Encoding {
    type Error = eyre::Report;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Encoding> for String {
    fn from(value: Encoding) -> Self {
        match value {
            Encoding::Utf8 => "utf-8".to_string(),
            Encoding::Latin1 => "latin-1".to_string(),
        }
    }
}

impl Encoding {
    fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Self::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|e| eyre!("Invalid UTF-8 in input: {}", e)),
            Self::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

/// How a delimited file is laid out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvOptions {
    /// First row holds column names
    pub headers: bool,
    pub delimiter: u8,
    pub encoding: Encoding,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            headers: true,
            delimiter: b',',
            encoding: Encoding::Utf8,
        }
    }
}

/// Rows of a delimited file, optionally inside a zip archive
pub struct CsvRowSource {
    location: SourceLocation,
    name: String,
    options: CsvOptions,
}

impl CsvRowSource {
    pub fn new(path: &str, options: CsvOptions) -> Self {
        Self {
            location: SourceLocation::parse(path),
            name: path.to_string(),
            options,
        }
    }

    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    fn reader(&self) -> Result<csv::Reader<Box<dyn Read + Send>>> {
        let input = self.location.open()?;
        Ok(csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.options.delimiter)
            // Stray quotes are common in pipe-separated extracts
            .quoting(self.options.delimiter != b'|')
            .from_reader(input))
    }

    /// A TEXT schema and a by-name mapping derived from the header row
    ///
    /// Header names become field names with `- ( ) . / ,` and spaces
    /// replaced by underscores.
    pub fn infer_schema(&self, table: &str) -> Result<(TableSchema, FieldMapping)> {
        let mut records = self.reader()?.into_byte_records();
        let headers = match records.next() {
            Some(record) => decode_record(
                &record.with_context(|| format!("Failed to read headers of {}", self.name))?,
                self.options.encoding,
                true,
            )?,
            None => bail!("{} is empty, no headers to infer a schema from", self.name),
        };

        let unsafe_chars = Regex::new(r"[-\s().,/]")?;
        let mut fields = Vec::with_capacity(headers.len());
        let mut mapping = FieldMapping::new();
        for header in headers {
            let name = unsafe_chars.replace_all(&header, "_").into_owned();
            mapping.insert(
                name.clone(),
                Some(FieldSource::Column(ColumnRef::Name(header))),
            );
            fields.push(FieldSpec::new(name, ColumnKind::Text));
        }
        Ok((TableSchema::new(table, fields), mapping))
    }
}

fn decode_record(record: &csv::ByteRecord, encoding: Encoding, first: bool) -> Result<Vec<String>> {
    let mut cells = record
        .iter()
        .map(|cell| encoding.decode(cell))
        .collect::<Result<Vec<_>>>()?;
    if first && let Some(cell) = cells.first_mut() {
        *cell = cell.trim_start_matches('\u{feff}').to_string();
    }
    Ok(cells)
}

impl RowSource for CsvRowSource {
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
        let encoding = self.options.encoding;
        let mut records = self.reader()?.into_byte_records();

        let headers = if self.options.headers {
            match records.next() {
                Some(record) => Some(decode_record(&record?, encoding, true)?),
                None => return Ok(Box::new(std::iter::empty())),
            }
        } else {
            None
        };

        let mut first = headers.is_none();
        Ok(Box::new(records.map(move |record| {
            let cells = decode_record(&record?, encoding, first)?;
            first = false;
            Ok(match &headers {
                Some(headers) => {
                    let mut cells = cells.into_iter();
                    RawRow::Named(
                        headers
                            .iter()
                            .map(|h| (h.clone(), cells.next()))
                            .collect::<BTreeMap<_, _>>(),
                    )
                }
                None => RawRow::Positional(cells),
            })
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &[u8]) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path.display().to_string()
    }

    #[test]
    fn test_header_rows_with_bom() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "in.csv", "\u{feff}ID,Letter\n1,A\n2\n".as_bytes());

        let source = CsvRowSource::new(&path, CsvOptions::default());
        let rows: Vec<_> = source.rows().unwrap().collect::<Result<_>>().unwrap();

        assert_eq!(rows.len(), 2);
        let RawRow::Named(first) = &rows[0] else {
            panic!("expected named row");
        };
        assert_eq!(first["ID"].as_deref(), Some("1"));
        let RawRow::Named(short) = &rows[1] else {
            panic!("expected named row");
        };
        assert_eq!(short["Letter"], None);
    }

    #[test]
    fn test_positional_pipe_rows_keep_quotes() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "in.txt", b"1|\"A|x\n2|B|y\n");

        let options = CsvOptions {
            headers: false,
            delimiter: b'|',
            ..CsvOptions::default()
        };
        let source = CsvRowSource::new(&path, options);
        let rows: Vec<_> = source.rows().unwrap().collect::<Result<_>>().unwrap();

        assert_eq!(rows[0], RawRow::positional(["1", "\"A", "x"]));
        assert_eq!(source.count_rows().unwrap(), 2);
    }

    #[test]
    fn test_latin1_decoding() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "in.csv", b"name\nCaf\xe9\n");

        let options = CsvOptions {
            encoding: "latin-1".parse().unwrap(),
            ..CsvOptions::default()
        };
        let rows: Vec<_> = CsvRowSource::new(&path, options)
            .rows()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows[0], RawRow::named([("name", "Café")]));
    }

    #[test]
    fn test_invalid_utf8_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "in.csv", b"name\nCaf\xe9\n");

        let source = CsvRowSource::new(&path, CsvOptions::default());
        let mut rows = source.rows().unwrap();
        assert!(rows.next().unwrap().is_err());
    }

    #[test]
    fn test_infer_schema_sanitises_headers() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "in.csv", b"Post Code,Price (GBP),date/time\n");

        let (schema, mapping) = CsvRowSource::new(&path, CsvOptions::default())
            .infer_schema("prices")
            .unwrap();

        let names: Vec<_> = schema.field_names().collect();
        assert_eq!(names, vec!["Post_Code", "Price__GBP_", "date_time"]);
        assert!(schema.fields.iter().all(|f| f.kind == ColumnKind::Text));
        assert_eq!(
            mapping["Price__GBP_"],
            Some(FieldSource::Column(ColumnRef::Name("Price (GBP)".into())))
        );
    }

    #[test]
    fn test_missing_file_hashes_to_name() {
        let source = CsvRowSource::new("/nonexistent/in.csv", CsvOptions::default());
        assert_eq!(source.content_hash().unwrap(), "/nonexistent/in.csv");
        assert!(source.rows().is_err());
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!("UTF-8-SIG".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("iso-8859-1".parse::<Encoding>().unwrap(), Encoding::Latin1);
        assert!("ebcdic".parse::<Encoding>().is_err());
    }
}
