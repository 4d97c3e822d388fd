use crate::error::{HandoffError, Result};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically replace `path` with `data` using a tempfile in the same directory.
/// Readers see either the old or the new content, never a partial write.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| HandoffError::workspace(dir, e))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| HandoffError::workspace(dir, e))?;
    tmp.write_all(data)
        .map_err(|e| HandoffError::workspace(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| HandoffError::workspace(path, e))?;
    tmp.persist(path)
        .map_err(|e| HandoffError::workspace(path, e.error))?;
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| HandoffError::workspace(path, e))
}

/// Write a file that must not exist yet. Fails with `AlreadyExists` rather
/// than overwriting.
pub fn write_new(path: &Path, data: &[u8]) -> Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| HandoffError::workspace(path, e))?;
    f.write_all(data)
        .map_err(|e| HandoffError::workspace(path, e))?;
    Ok(())
}

/// Append text to a file, creating it if it doesn't exist.
pub fn append_text(path: &Path, text: &str) -> Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| HandoffError::workspace(path, e))?;
    f.write_all(text.as_bytes())
        .map_err(|e| HandoffError::workspace(path, e))?;
    Ok(())
}
