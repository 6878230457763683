//! files.rs
//! Sandboxed access to the recording output tree for the `/files` and
//! `/download` endpoints. Every requested path is resolved against the
//! sandbox base and rejected if, after normalization, it escapes it;
//! the filesystem is never touched with an unchecked path.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, PartialEq, Eq)]
pub enum FileAccessError {
    /// The normalized path leaves the sandbox.
    Escape,
    /// Inside the sandbox but nothing is there.
    NotFound,
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Resolves `requested` inside `base`, following the real filesystem
/// (symlinks included) and refusing anything that ends up outside.
pub fn resolve(base: &Path, requested: &str) -> Result<PathBuf, FileAccessError> {
    let base = base.canonicalize().map_err(|_| FileAccessError::NotFound)?;
    let joined = base.join(requested.trim_start_matches('/'));
    let resolved = joined
        .canonicalize()
        .map_err(|_| FileAccessError::NotFound)?;
    if !resolved.starts_with(&base) {
        return Err(FileAccessError::Escape);
    }
    Ok(resolved)
}

/// Directory listing for `/files`, directories first, names sorted.
pub fn list(dir: &Path) -> std::io::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        entries.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: meta.len(),
        });
    }
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then(a.name.cmp(&b.name)));
    Ok(entries)
}
