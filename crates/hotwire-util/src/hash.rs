use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Length of the short hashes embedded in cache metadata and `?v=` queries.
pub const SHORT_HASH_LEN: usize = 8;

/// Compute the BLAKE3 hash of a file, returning the hex-encoded digest.
///
/// Streams the file content so large lockfiles are not read into memory.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn blake3_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Hash several inputs as one, truncated to [`SHORT_HASH_LEN`] hex chars.
///
/// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
#[must_use]
pub fn short_hash<I, B>(parts: I) -> String
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    let hex = hasher.finalize().to_hex();
    hex[..SHORT_HASH_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_blake3_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        let hash = blake3_file(file.path()).unwrap();

        // Known BLAKE3 hash of "hello world"
        assert_eq!(
            hash,
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_blake3_file_not_found() {
        let result = blake3_file(Path::new("/nonexistent/package-lock.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_short_hash_is_stable_and_short() {
        let a = short_hash(["react", "react-dom"]);
        let b = short_hash(["react", "react-dom"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), SHORT_HASH_LEN);
    }

    #[test]
    fn test_short_hash_part_boundaries_matter() {
        assert_ne!(short_hash(["ab", "c"]), short_hash(["a", "bc"]));
    }
}
