//! Input locations: plain files and members of zip archives

use eyre::{Context, Result, eyre};
use regex::Regex;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

/// Where an input file lives
///
/// `data/prices.zip/prices-2024.csv` names a member inside an archive. The
/// member may be a `*` glob, and an empty member selects the first entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    File(PathBuf),
    ArchiveMember { archive: PathBuf, member: String },
}

impl SourceLocation {
    /// Split a path at its `.zip` segment, if any
    pub fn parse(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        let Some(at) = lower.find(".zip") else {
            return Self::File(PathBuf::from(path));
        };
        let end = at + ".zip".len();
        let member = path[end..].trim_start_matches(['/', '\\']);
        Self::ArchiveMember {
            archive: PathBuf::from(&path[..end]),
            member: member.to_string(),
        }
    }

    /// The file on disk: the plain file, or the archive holding the member
    pub fn disk_path(&self) -> &Path {
        match self {
            Self::File(path) => path,
            Self::ArchiveMember { archive, .. } => archive,
        }
    }

    pub fn exists(&self) -> bool {
        self.disk_path().is_file()
    }

    /// True when the location names one specific archive member
    pub fn is_exact_member(&self) -> bool {
        matches!(self, Self::ArchiveMember { member, .. } if !member.is_empty() && !member.contains('*'))
    }

    /// Open the location for reading
    ///
    /// Archive members are decompressed into memory; zip entries cannot be
    /// streamed once the archive handle is dropped.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match self {
            Self::File(path) => {
                let file = File::open(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                Ok(Box::new(BufReader::new(file)))
            }
            Self::ArchiveMember { archive, member } => {
                let bytes = read_member(archive, member)?;
                Ok(Box::new(Cursor::new(bytes)))
            }
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::ArchiveMember { archive, member } if member.is_empty() => {
                write!(f, "{}", archive.display())
            }
            Self::ArchiveMember { archive, member } => {
                write!(f, "{}/{}", archive.display(), member)
            }
        }
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped))
        .with_context(|| format!("Invalid archive member pattern '{}'", pattern))
}

/// Name of the archive entry selected by `member`
fn resolve_member<R: Read + std::io::Seek>(zip: &ZipArchive<R>, member: &str) -> Result<String> {
    if member.is_empty() {
        return zip
            .file_names()
            .next()
            .map(str::to_string)
            .ok_or_else(|| eyre!("Archive is empty"));
    }
    if !member.contains('*') {
        return Ok(member.to_string());
    }
    let pattern = glob_to_regex(member)?;
    let mut names: Vec<&str> = zip.file_names().filter(|n| pattern.is_match(n)).collect();
    names.sort_unstable();
    names
        .first()
        .map(|n| n.to_string())
        .ok_or_else(|| eyre!("No archive member matches '{}'", member))
}

/// Read one member of a zip archive into memory
pub fn read_member(archive: &Path, member: &str) -> Result<Vec<u8>> {
    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("Failed to read archive {}", archive.display()))?;

    let name = resolve_member(&zip, member)?;
    let mut entry = zip
        .by_name(&name)
        .with_context(|| format!("Member '{}' not found in {}", name, archive.display()))?;

    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .with_context(|| format!("Failed to extract '{}' from {}", name, archive.display()))?;
    log::debug!("Extracted {} bytes from {}/{}", bytes.len(), archive.display(), name);
    Ok(bytes)
}
