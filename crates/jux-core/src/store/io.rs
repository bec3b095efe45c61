//! Filesystem helpers: private directories and atomic temp-then-rename writes.
//!
//! Temp files are created inside the target directory so the final rename
//! never crosses a filesystem. `tempfile` creates them `0600` on Unix.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use fs2::FileExt;

use super::error::{StorageError, StorageResult};

/// Prefix shared by in-flight temp files; listing skips these.
pub(crate) const TEMP_PREFIX: &str = ".tmp-";

/// Create `dir` (and parents) with owner-only permissions.
pub(crate) fn create_dir_private(dir: &Path) -> StorageResult<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| StorageError::io(dir, e))
}

fn write_temp(path: &Path, content: &[u8]) -> StorageResult<tempfile::NamedTempFile> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| StorageError::io(dir, e))?;
    temp.write_all(content)
        .map_err(|e| StorageError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StorageError::io(temp.path(), e))?;
    Ok(temp)
}

/// Write `content` to `path` unless something is already there.
///
/// Returns `false` when `path` already existed; the existing file is
/// left untouched.
pub(crate) fn write_new(path: &Path, content: &[u8]) -> StorageResult<bool> {
    let temp = write_temp(path, content)?;
    match temp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StorageError::io(path, e.error)),
    }
}

/// Atomically replace `path` with `content`.
pub(crate) fn write_replace(path: &Path, content: &[u8]) -> StorageResult<()> {
    let temp = write_temp(path, content)?;
    temp.persist(path)
        .map_err(|e| StorageError::io(path, e.error))?;
    Ok(())
}

fn open_lock_file(path: &Path) -> StorageResult<File> {
    let mut options = OpenOptions::new();
    options.create(true).truncate(false).read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(|e| StorageError::io(path, e))
}

/// Block until the exclusive advisory lock on `path` is ours. Dropping the
/// returned file releases it.
pub(crate) fn lock_exclusive(path: &Path) -> StorageResult<File> {
    let file = open_lock_file(path)?;
    FileExt::lock_exclusive(&file).map_err(|e| StorageError::io(path, e))?;
    Ok(file)
}

/// Take the exclusive lock on `path` unless someone else holds it.
pub(crate) fn try_lock_exclusive(path: &Path) -> StorageResult<Option<File>> {
    let file = open_lock_file(path)?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(Some(file)),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

/// Read a file, mapping a missing file to `None`.
pub(crate) fn read_optional(path: &Path) -> StorageResult<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

/// Remove a file; a file that is already gone counts as removed.
pub(crate) fn remove_file(path: &Path) -> StorageResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_new_does_not_clobber() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.xml");

        assert!(write_new(&path, b"first").unwrap());
        assert!(!write_new(&path, b"second").unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_replace_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.json");

        write_replace(&path, b"{}").unwrap();
        write_replace(&path, b"{\"v\":2}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"v\":2}");
    }

    #[test]
    fn test_try_lock_is_exclusive_until_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("h.claim");

        let held = try_lock_exclusive(&path).unwrap();
        assert!(held.is_some());
        assert!(try_lock_exclusive(&path).unwrap().is_none());

        drop(held);
        assert!(try_lock_exclusive(&path).unwrap().is_some());
    }

    #[test]
    fn test_read_optional_and_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone");

        assert_eq!(read_optional(&path).unwrap(), None);
        remove_file(&path).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_private_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("store").join("reports");
        create_dir_private(&nested).unwrap();
        let mode = std::fs::metadata(&nested).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        let file = nested.join("x.xml");
        write_new(&file, b"x").unwrap();
        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
