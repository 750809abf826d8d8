use std::fs::File;
use std::path::Path;

use tar::{Archive, Builder, EntryType, Header};

use crate::error::{Result, UpdateError};
use crate::util::{self, EntryKind};

/// Unpacks an assets archive into a generation directory.
pub trait ArchiveExtractor: Send + Sync {
    /// Returns the number of regular files written.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<usize>;
}

/// Plain (uncompressed) tar, the `assets.tar` format.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarExtractor;

impl ArchiveExtractor for TarExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<usize> {
        std::fs::create_dir_all(dest).map_err(|e| UpdateError::storage(dest, e))?;
        let file = File::open(archive).map_err(|e| UpdateError::storage(archive, e))?;

        let mut tar = Archive::new(file);
        tar.set_overwrite(true);
        tar.set_preserve_mtime(false);

        let mut files = 0;
        let entries = tar
            .entries()
            .map_err(|e| UpdateError::Archive(format!("{}: {e}", archive.display())))?;
        for entry in entries {
            let mut entry =
                entry.map_err(|e| UpdateError::Archive(format!("{}: {e}", archive.display())))?;
            let is_file = entry.header().entry_type().is_file();
            let name = entry
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();

            // unpack_in refuses paths that would land outside `dest`.
            let written = entry
                .unpack_in(dest)
                .map_err(|e| UpdateError::Archive(format!("{name}: {e}")))?;
            if !written {
                return Err(UpdateError::Archive(format!("entry {name} escapes the destination")));
            }
            if is_file {
                files += 1;
            }
        }

        tracing::debug!(archive = %archive.display(), files, "assets extracted");
        Ok(files)
    }
}

/// Build a reproducible tar of `dir`: sorted entries, zeroed ownership and mtimes.
pub fn pack_directory(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());

    for entry in util::walk_directory(dir)? {
        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        match entry.kind {
            EntryKind::Dir => {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder
                    .append_data(&mut header, &entry.relative_path, std::io::empty())
                    .map_err(|e| UpdateError::Archive(format!("{}: {e}", entry.relative_path)))?;
            }
            EntryKind::File => {
                let data = util::map_file(&entry.full_path)?;
                header.set_entry_type(EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                builder
                    .append_data(&mut header, &entry.relative_path, &*data)
                    .map_err(|e| UpdateError::Archive(format!("{}: {e}", entry.relative_path)))?;
            }
        }
    }

    builder
        .into_inner()
        .map_err(|e| UpdateError::Archive(format!("finish archive: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(root: &Path, files: &[(&str, &[u8])]) {
        for (rel, content) in files {
            let full = root.join(rel);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
    }

    #[test]
    fn test_pack_then_extract() {
        let src = tempfile::tempdir().unwrap();
        tree(
            src.path(),
            &[("main.jsbundle", b"bundle v1"), ("img/logo.png", &[0x89, 0x50, 0x4E])],
        );

        let archive = pack_directory(src.path()).unwrap();
        let out = tempfile::tempdir().unwrap();
        let archive_path = out.path().join("assets.tar");
        std::fs::write(&archive_path, &archive).unwrap();

        let dest = out.path().join("data");
        let files = TarExtractor.extract(&archive_path, &dest).unwrap();
        assert_eq!(files, 2);
        assert_eq!(std::fs::read(dest.join("main.jsbundle")).unwrap(), b"bundle v1");
        assert_eq!(std::fs::read(dest.join("img/logo.png")).unwrap(), [0x89, 0x50, 0x4E]);
    }

    #[test]
    fn test_pack_is_reproducible() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let files: &[(&str, &[u8])] = &[("x/y.txt", b"same"), ("z.txt", b"also same")];
        tree(a.path(), files);
        tree(b.path(), files);
        assert_eq!(pack_directory(a.path()).unwrap(), pack_directory(b.path()).unwrap());
    }

    #[test]
    fn test_extract_overwrites_existing_files() {
        let src = tempfile::tempdir().unwrap();
        tree(src.path(), &[("main.jsbundle", b"new")]);
        let archive = pack_directory(src.path()).unwrap();

        let out = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join("main.jsbundle"), b"old contents").unwrap();
        let archive_path = out.path().join("assets.tar");
        std::fs::write(&archive_path, archive).unwrap();

        TarExtractor.extract(&archive_path, out.path()).unwrap();
        assert_eq!(std::fs::read(out.path().join("main.jsbundle")).unwrap(), b"new");
    }

    #[test]
    fn test_extract_corrupt_archive_fails() {
        let out = tempfile::tempdir().unwrap();
        let archive_path = out.path().join("assets.tar");
        std::fs::write(&archive_path, vec![0x42u8; 1024]).unwrap();
        let err = TarExtractor.extract(&archive_path, &out.path().join("data")).unwrap_err();
        assert!(matches!(err, UpdateError::Archive(_)), "{err}");
    }
}
