//! File helpers for the `.technic/` directory.

use crate::error::Result;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Create `path` holding `data` unless a file is already there. Returns
/// true if this call wrote it.
///
/// The data is staged in a tempfile next to `path` and linked into place
/// without clobbering, so `path` is either absent or complete.
pub fn write_if_missing(path: &Path, data: &[u8]) -> Result<bool> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    if path.exists() {
        return Ok(false);
    }
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(data)?;
    staged.flush()?;
    match staged.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error.into()),
    }
}
