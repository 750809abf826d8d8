use memmap2::Mmap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::error::{Result, UpdateError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Forward-slash path relative to the walked root.
    pub relative_path: String,
    pub kind: EntryKind,
    pub full_path: PathBuf,
}

/// Walk a directory tree, parents before children, siblings sorted by name.
/// The order is stable across platforms so archives built from it are reproducible.
pub fn walk_directory(root: &Path) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            UpdateError::storage(&path, e.into())
        })?;

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(root)
            .map_err(|_| UpdateError::Archive(format!("{} escapes {}", full_path.display(), root.display())))?;
        let relative_path = relative
            .to_str()
            .ok_or_else(|| UpdateError::Archive(format!("non-UTF8 path: {}", relative.display())))?
            .replace('\\', "/");

        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        entries.push(DirEntry {
            relative_path,
            kind,
            full_path,
        });
    }

    Ok(entries)
}

/// Read-only view of a whole file, memory-mapped when non-empty.
pub enum FileBytes {
    Mapped(Mmap),
    Empty,
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(map) => map,
            FileBytes::Empty => &[],
        }
    }
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Generation files are only written by the single update
/// worker, which never maps a file it is writing.
pub fn map_file(path: &Path) -> Result<FileBytes> {
    let file = std::fs::File::open(path).map_err(|e| UpdateError::storage(path, e))?;
    let len = file.metadata().map_err(|e| UpdateError::storage(path, e))?.len();
    if len == 0 {
        return Ok(FileBytes::Empty);
    }
    // SAFETY: see above; no concurrent writer truncates the file while mapped.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| UpdateError::storage(path, e))?;
    Ok(FileBytes::Mapped(map))
}

pub fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Ensure a base URI ends with exactly one trailing slash.
pub fn normalize_base_uri(uri: &str) -> String {
    let trimmed = uri.trim_end_matches('/');
    format!("{trimmed}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_is_sorted_parent_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b/inner")).unwrap();
        std::fs::write(dir.path().join("b/inner/z.txt"), b"z").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b/c.txt"), b"c").unwrap();

        let paths: Vec<String> = walk_directory(dir.path())
            .unwrap()
            .into_iter()
            .map(|e| e.relative_path)
            .collect();
        assert_eq!(paths, vec!["a.txt", "b", "b/c.txt", "b/inner", "b/inner/z.txt"]);
    }

    #[test]
    fn test_map_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert!(map_file(&path).unwrap().is_empty());

        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(&*map_file(&path).unwrap(), b"abc");
    }

    #[test]
    fn test_normalize_base_uri() {
        assert_eq!(normalize_base_uri("http://h/x"), "http://h/x/");
        assert_eq!(normalize_base_uri("http://h/x//"), "http://h/x/");
    }
}
