use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// Read a file to string, replacing invalid UTF-8 sequences with the replacement character.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub fn read_to_string_lossy(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Atomically write bytes to a file by writing to a temp file then renaming.
///
/// The file either has the old contents or the new contents, never a partial write.
///
/// # Errors
/// Returns an error if the write or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));

    // Same directory, so the rename stays on one filesystem
    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ));

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    match fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            if cfg!(windows) {
                fs::copy(&temp_path, path)?;
                let _ = fs::remove_file(&temp_path);
                Ok(())
            } else {
                let _ = fs::remove_file(&temp_path);
                Err(e)
            }
        }
    }
}

/// Remove a directory tree, treating "already gone" as success.
///
/// # Errors
/// Returns an error for any failure other than `NotFound`.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Move a fully written directory `from` into place at `to`.
///
/// Any previous `to` is removed first. After the rename `to` contains
/// exactly the contents of `from`.
///
/// # Errors
/// Returns an error if the old directory cannot be removed or the rename fails.
pub fn replace_dir(from: &Path, to: &Path) -> io::Result<()> {
    remove_dir_if_exists(to)?;
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_read_to_string_lossy_invalid_utf8() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x80, 0x81])
            .unwrap();
        file.flush().unwrap();

        let content = read_to_string_lossy(file.path()).unwrap();
        assert!(content.starts_with("Hello"));
        assert!(content.contains('\u{FFFD}'));
    }

    #[test]
    fn test_atomic_write_overwrites_without_leftovers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("_metadata.json");

        atomic_write(&path, b"{}").unwrap();
        atomic_write(&path, b"{\"hash\":\"x\"}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"hash\":\"x\"}");

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_remove_dir_if_exists_missing_is_ok() {
        let dir = tempdir().unwrap();
        assert!(remove_dir_if_exists(&dir.path().join("nope")).is_ok());
    }

    #[test]
    fn test_replace_dir_swaps_contents() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("deps");
        let new = dir.path().join("deps_temp");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("stale.js"), "old").unwrap();
        fs::create_dir_all(&new).unwrap();
        fs::write(new.join("react.js"), "new").unwrap();

        replace_dir(&new, &old).unwrap();

        assert!(!new.exists());
        assert!(!old.join("stale.js").exists());
        assert_eq!(fs::read_to_string(old.join("react.js")).unwrap(), "new");
    }
}
