//! Content hashing for input identity

use super::SourceLocation;
use eyre::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Read;

/// Hex SHA-256 of a byte slice
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex SHA-256 of everything a reader yields
pub fn hash_reader(mut reader: impl Read) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer).context("Failed to read input for hashing")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Content hash of an input location
///
/// A named archive member hashes the member's bytes. A bare archive or a
/// glob member hashes the archive as a whole, since the member it resolves
/// to may change.
pub fn hash_location(location: &SourceLocation) -> Result<String> {
    let hash = if location.is_exact_member() {
        hash_reader(location.open()?)?
    } else {
        let path = location.disk_path();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
        hash_reader(std::io::BufReader::new(file))?
    };
    log::debug!("Content hash of {} is {}", location, hash);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            hash_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hash_reader(&b"hello\n"[..]).unwrap(),
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn test_same_content_different_paths() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.csv");
        let b = temp.path().join("b.csv");
        std::fs::write(&a, "ID,Letter\n1,A\n").unwrap();
        std::fs::write(&b, "ID,Letter\n1,A\n").unwrap();

        assert_eq!(
            hash_location(&SourceLocation::File(a)).unwrap(),
            hash_location(&SourceLocation::File(b)).unwrap()
        );
    }

    #[test]
    fn test_member_hash_matches_plain_file() {
        let temp = TempDir::new().unwrap();
        let plain = temp.path().join("letters.csv");
        std::fs::write(&plain, "ID,Letter\n1,A\n").unwrap();

        let archive = temp.path().join("letters.zip");
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
        zip.start_file("letters.csv", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"ID,Letter\n1,A\n").unwrap();
        zip.finish().unwrap();

        let member = SourceLocation::ArchiveMember {
            archive: archive.clone(),
            member: "letters.csv".into(),
        };
        let whole = SourceLocation::ArchiveMember {
            archive,
            member: String::new(),
        };

        let plain_hash = hash_location(&SourceLocation::File(plain)).unwrap();
        assert_eq!(hash_location(&member).unwrap(), plain_hash);
        assert_ne!(hash_location(&whole).unwrap(), plain_hash);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let location = SourceLocation::parse("/nonexistent/input.csv");
        assert!(hash_location(&location).is_err());
    }
}
