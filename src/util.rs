//! Small filesystem helpers shared across the crate.

use std::{
    fs,
    io::{ErrorKind, Result, Write},
    path::Path,
};

use tempfile::NamedTempFile;

/// Returns true if the path exists (any file type).
pub fn path_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().symlink_metadata().is_ok()
}

/// Reads a marker file and strips surrounding whitespace.
///
/// Marker files written by the kernel (and by ourselves) often carry a
/// trailing newline; every consumer in this crate wants the trimmed value.
pub fn read_trimmed(path: impl AsRef<Path>) -> Result<String> {
    let data = fs::read_to_string(path)?;
    Ok(data.trim().to_string())
}

/// Writes `data` to `path` via a temporary file in the same directory
/// followed by an atomic rename, so a concurrent reader never observes a
/// partially written file.
pub fn atomic_write(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
