//! Three-generation bundle store.
//!
//! ```text
//! <root>/stable_patch/<stamp>/   last known-good bundle
//! <root>/newest_patch/<stamp>/   most recently installed bundle, preferred when valid
//! <root>/tmp_patch/<stamp>/      staging area written by the downloader
//! ```
//!
//! `<stamp>` is the host application's install time, so patches built against an older
//! host build are never picked up after the host itself is upgraded. Every transition
//! between slots is a directory rename; a replaced directory is first renamed to a
//! `dropped_*` sibling and then deleted in the background.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error, info, warn};

use crate::error::{Result, UpdateError};
use crate::patch_format::{PatchMeta, ASSETS_FILE, DATA_FILE, META_FILE};
use crate::util;

const DROPPED_PREFIX: &str = "dropped_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationKind {
    Stable,
    Newest,
    Temp,
}

impl GenerationKind {
    pub const ALL: [GenerationKind; 3] = [
        GenerationKind::Stable,
        GenerationKind::Newest,
        GenerationKind::Temp,
    ];

    fn slot_name(self) -> &'static str {
        match self {
            GenerationKind::Stable => "stable_patch",
            GenerationKind::Newest => "newest_patch",
            GenerationKind::Temp => "tmp_patch",
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenerationKind::Stable => "stable",
            GenerationKind::Newest => "newest",
            GenerationKind::Temp => "temp",
        };
        f.write_str(name)
    }
}

/// A generation that passed validation and can be loaded by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveGeneration {
    pub kind: GenerationKind,
    pub version: u32,
    pub dir: PathBuf,
    pub bundle: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GenerationStore {
    root: PathBuf,
    stamp: String,
    bundle_name: String,
}

impl GenerationStore {
    pub fn new(root: impl Into<PathBuf>, stamp: impl Into<String>, bundle_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            stamp: stamp.into(),
            bundle_name: bundle_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// Parent directory holding every stamp of one kind.
    pub fn slot_dir(&self, kind: GenerationKind) -> PathBuf {
        self.root.join(kind.slot_name())
    }

    /// The directory backing `kind` for the current host stamp.
    pub fn dir(&self, kind: GenerationKind) -> PathBuf {
        self.slot_dir(kind).join(&self.stamp)
    }

    pub fn meta_file(&self, kind: GenerationKind) -> PathBuf {
        self.dir(kind).join(META_FILE)
    }

    pub fn data_file(&self, kind: GenerationKind) -> PathBuf {
        self.dir(kind).join(DATA_FILE)
    }

    pub fn assets_file(&self, kind: GenerationKind) -> PathBuf {
        self.dir(kind).join(ASSETS_FILE)
    }

    pub fn bundle_file(&self, kind: GenerationKind) -> PathBuf {
        self.dir(kind).join(&self.bundle_name)
    }

    pub fn bundle_name(&self) -> &str {
        &self.bundle_name
    }

    /// `Newest` if valid, else `Stable` if valid, else `None`.
    pub fn resolve_active(&self) -> Option<ActiveGeneration> {
        [GenerationKind::Newest, GenerationKind::Stable]
            .into_iter()
            .find_map(|kind| self.validate(kind))
    }

    /// Checks one loadable generation: bundle and metadata present, header accepted.
    pub fn validate(&self, kind: GenerationKind) -> Option<ActiveGeneration> {
        let dir = self.dir(kind);
        if !dir.is_dir() {
            debug!(generation = %kind, dir = %dir.display(), "no generation directory");
            return None;
        }

        let bundle = self.bundle_file(kind);
        if !bundle.is_file() {
            warn!(generation = %kind, bundle = %bundle.display(), "bundle file missing");
            return None;
        }

        let meta = match PatchMeta::load(&self.meta_file(kind)) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(generation = %kind, error = %e, "metadata unreadable");
                return None;
            }
        };
        if let Err(e) = meta.verify_header() {
            warn!(generation = %kind, error = %e, "metadata rejected");
            return None;
        }

        info!(generation = %kind, version = meta.version(), "bundle generation available");
        Some(ActiveGeneration {
            kind,
            version: meta.version(),
            dir,
            bundle,
        })
    }

    /// True when `Temp` holds both halves of a downloaded patch.
    pub fn temp_ready(&self) -> bool {
        self.meta_file(GenerationKind::Temp).is_file() && self.data_file(GenerationKind::Temp).is_file()
    }

    /// Discard whatever `Temp` holds and create it empty.
    pub fn reset_temp(&self) -> Result<PathBuf> {
        let dir = self.dir(GenerationKind::Temp);
        self.discard(&dir)?;
        std::fs::create_dir_all(&dir).map_err(|e| UpdateError::storage(&dir, e))?;
        Ok(dir)
    }

    /// `Newest` moves into `Stable`, `Temp` moves into `Newest`.
    ///
    /// Replaced directories are parked under `dropped_*` names and deleted only after
    /// every rename succeeded. If a rename fails, the renames already done are undone
    /// and the slots are left as they were. A `Newest` that fails validation is
    /// dropped instead of demoting a good `Stable`.
    pub fn promote(&self) -> Result<()> {
        let temp = self.dir(GenerationKind::Temp);
        if !temp.is_dir() {
            return Err(UpdateError::NoPatchFound(temp));
        }

        let newest = self.dir(GenerationKind::Newest);
        let stable = self.dir(GenerationKind::Stable);

        let mut undo: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut parked: Vec<PathBuf> = Vec::new();
        let result = self.shift_slots(&temp, &newest, &stable, &mut undo, &mut parked);

        if let Err(e) = result {
            for (from, to) in undo.iter().rev() {
                if let Err(restore) = std::fs::rename(from, to) {
                    error!(from = %from.display(), to = %to.display(), error = %restore, "could not undo promotion step");
                }
            }
            return Err(e);
        }

        parked.into_iter().for_each(spawn_removal);
        info!(from = %temp.display(), to = %newest.display(), "patch promoted to newest");
        Ok(())
    }

    /// The renames behind `promote`. Every completed rename is recorded in `undo` as
    /// `(current, original)`; directories to delete afterwards go to `parked`.
    fn shift_slots(
        &self,
        temp: &Path,
        newest: &Path,
        stable: &Path,
        undo: &mut Vec<(PathBuf, PathBuf)>,
        parked: &mut Vec<PathBuf>,
    ) -> Result<()> {
        if newest.exists() {
            if self.validate(GenerationKind::Newest).is_some() {
                ensure_dir(&self.slot_dir(GenerationKind::Stable))?;
                if let Some(old_stable) = self.detach(stable)? {
                    undo.push((old_stable.clone(), stable.to_path_buf()));
                    parked.push(old_stable);
                }
                rename(newest, stable)?;
                undo.push((stable.to_path_buf(), newest.to_path_buf()));
                info!(from = %newest.display(), to = %stable.display(), "newest demoted to stable");
            } else if let Some(broken) = self.detach(newest)? {
                undo.push((broken.clone(), newest.to_path_buf()));
                parked.push(broken);
            }
        }

        ensure_dir(&self.slot_dir(GenerationKind::Newest))?;
        rename(temp, newest)
    }

    /// Move `kind`'s directory out of its slot. Returns `false` if it was not there.
    pub fn demote(&self, kind: GenerationKind) -> Result<bool> {
        let dir = self.dir(kind);
        if !dir.exists() {
            return Ok(false);
        }
        self.discard(&dir)?;
        info!(generation = %kind, "generation demoted");
        Ok(true)
    }

    /// Remove directories of other host stamps and leftovers of interrupted deletions.
    pub fn prune_stale(&self) {
        for kind in GenerationKind::ALL {
            let slot = self.slot_dir(kind);
            let Ok(entries) = std::fs::read_dir(&slot) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name == self.stamp {
                    continue;
                }
                let path = entry.path();
                if name.starts_with(DROPPED_PREFIX) {
                    spawn_removal(path);
                } else if let Err(e) = self.discard(&path) {
                    warn!(path = %path.display(), error = %e, "could not drop stale generation");
                } else {
                    info!(generation = %kind, stamp = %name, "dropped generation of an older host build");
                }
            }
        }
    }

    /// Rename `path` to a fresh `dropped_*` sibling, then delete that in the background.
    /// A missing `path` is not an error. Until the rename succeeds nothing is deleted.
    fn discard(&self, path: &Path) -> Result<()> {
        if let Some(dropped) = self.detach(path)? {
            spawn_removal(dropped);
        }
        Ok(())
    }

    /// Rename `path` to a fresh `dropped_*` sibling and return where it went.
    /// `None` if `path` did not exist.
    fn detach(&self, path: &Path) -> Result<Option<PathBuf>> {
        if !path.exists() {
            return Ok(None);
        }
        let parent = path.parent().unwrap_or(&self.root);
        let dropped = parent.join(dropped_name());
        rename(path, &dropped)?;
        debug!(from = %path.display(), to = %dropped.display(), "detached for deletion");
        Ok(Some(dropped))
    }
}

fn dropped_name() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{DROPPED_PREFIX}{}_{}_{seq}", util::unix_millis(), std::process::id())
}

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| UpdateError::storage(dir, e))
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to).map_err(|e| {
        warn!(from = %from.display(), to = %to.display(), error = %e, "rename failed");
        UpdateError::storage(from, e)
    })
}

/// Fire-and-forget recursive delete of a path no slot refers to any more.
fn spawn_removal(path: PathBuf) {
    let remove = move || match std::fs::remove_dir_all(&path) {
        Ok(()) => debug!(path = %path.display(), "dropped generation deleted"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete dropped generation"),
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(remove);
        }
        Err(_) => {
            std::thread::spawn(remove);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_format::PatchMeta;

    fn store(root: &Path) -> GenerationStore {
        GenerationStore::new(root, "1700000000000", "main.jsbundle")
    }

    fn populate(store: &GenerationStore, kind: GenerationKind, version: u32) {
        let dir = store.dir(kind);
        std::fs::create_dir_all(&dir).unwrap();
        PatchMeta::seal(version, b"body").save(&store.meta_file(kind)).unwrap();
        std::fs::write(store.bundle_file(kind), format!("bundle {version}")).unwrap();
    }

    fn dropped_entries(slot: &Path) -> usize {
        std::fs::read_dir(slot)
            .map(|it| {
                it.flatten()
                    .filter(|e| e.file_name().to_string_lossy().starts_with(DROPPED_PREFIX))
                    .count()
            })
            .unwrap_or(0)
    }

    #[test]
    fn test_empty_store_has_no_active() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store(dir.path()).resolve_active(), None);
    }

    #[test]
    fn test_newest_preferred_over_stable() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        populate(&s, GenerationKind::Stable, 3);
        populate(&s, GenerationKind::Newest, 4);
        let active = s.resolve_active().unwrap();
        assert_eq!(active.kind, GenerationKind::Newest);
        assert_eq!(active.version, 4);
    }

    #[test]
    fn test_invalid_newest_falls_back_to_stable() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        populate(&s, GenerationKind::Stable, 3);
        populate(&s, GenerationKind::Newest, 4);
        std::fs::remove_file(s.bundle_file(GenerationKind::Newest)).unwrap();
        assert_eq!(s.resolve_active().unwrap().kind, GenerationKind::Stable);

        populate(&s, GenerationKind::Newest, 4);
        std::fs::write(s.meta_file(GenerationKind::Newest), [2u8; 64]).unwrap();
        assert_eq!(s.resolve_active().unwrap().kind, GenerationKind::Stable);

        std::fs::write(s.meta_file(GenerationKind::Newest), [1u8; 10]).unwrap();
        assert_eq!(s.resolve_active().unwrap().kind, GenerationKind::Stable);
    }

    #[test]
    fn test_temp_is_never_active() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        populate(&s, GenerationKind::Temp, 9);
        assert_eq!(s.resolve_active(), None);
    }

    #[test]
    fn test_other_stamp_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let old = GenerationStore::new(dir.path(), "1", "main.jsbundle");
        populate(&old, GenerationKind::Newest, 8);
        let current = GenerationStore::new(dir.path(), "2", "main.jsbundle");
        assert_eq!(current.resolve_active(), None);
    }

    #[test]
    fn test_promote_shifts_generations() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        populate(&s, GenerationKind::Stable, 1);
        populate(&s, GenerationKind::Newest, 2);
        populate(&s, GenerationKind::Temp, 3);

        s.promote().unwrap();

        assert!(!s.dir(GenerationKind::Temp).exists());
        assert_eq!(s.validate(GenerationKind::Newest).unwrap().version, 3);
        assert_eq!(s.validate(GenerationKind::Stable).unwrap().version, 2);
        assert_eq!(s.resolve_active().unwrap().version, 3);
    }

    #[test]
    fn test_first_promote_without_newest() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        populate(&s, GenerationKind::Temp, 5);
        s.promote().unwrap();
        assert_eq!(s.resolve_active().unwrap().kind, GenerationKind::Newest);
        assert!(!s.dir(GenerationKind::Stable).exists());
    }

    #[test]
    fn test_promote_keeps_stable_when_newest_broken() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        populate(&s, GenerationKind::Stable, 1);
        populate(&s, GenerationKind::Newest, 2);
        std::fs::remove_file(s.bundle_file(GenerationKind::Newest)).unwrap();
        populate(&s, GenerationKind::Temp, 3);

        s.promote().unwrap();
        assert_eq!(s.validate(GenerationKind::Stable).unwrap().version, 1);
        assert_eq!(s.validate(GenerationKind::Newest).unwrap().version, 3);
    }

    #[test]
    fn test_promote_without_temp_fails() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        populate(&s, GenerationKind::Newest, 2);
        assert!(matches!(s.promote(), Err(UpdateError::NoPatchFound(_))));
        assert_eq!(s.resolve_active().unwrap().version, 2);
    }

    #[test]
    fn test_demote_renames_away() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        populate(&s, GenerationKind::Stable, 1);
        populate(&s, GenerationKind::Newest, 2);

        assert!(s.demote(GenerationKind::Newest).unwrap());
        assert!(!s.dir(GenerationKind::Newest).exists());
        assert_eq!(s.resolve_active().unwrap().kind, GenerationKind::Stable);
        assert!(!s.demote(GenerationKind::Newest).unwrap());
    }

    #[test]
    fn test_reset_temp_discards_partial_download() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        populate(&s, GenerationKind::Temp, 4);
        std::fs::write(s.data_file(GenerationKind::Temp), b"partial").unwrap();
        assert!(s.temp_ready());

        let temp = s.reset_temp().unwrap();
        assert!(temp.is_dir());
        assert_eq!(std::fs::read_dir(&temp).unwrap().count(), 0);
        assert!(!s.temp_ready());
    }

    /// Point `kind`'s slot inside `host`, so renaming `host` into that slot would
    /// move a directory into itself and fail.
    #[cfg(unix)]
    fn nest_slot_inside(s: &GenerationStore, kind: GenerationKind, host: &Path) {
        let inner = host.join("nested");
        std::fs::create_dir_all(&inner).unwrap();
        std::os::unix::fs::symlink(&inner, s.slot_dir(kind)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_demotion_to_stable_keeps_slots() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        populate(&s, GenerationKind::Newest, 2);
        nest_slot_inside(&s, GenerationKind::Stable, &s.dir(GenerationKind::Newest));
        populate(&s, GenerationKind::Stable, 1);
        populate(&s, GenerationKind::Temp, 3);

        assert!(matches!(s.promote(), Err(UpdateError::Storage { .. })));

        assert_eq!(s.validate(GenerationKind::Stable).unwrap().version, 1);
        assert_eq!(s.validate(GenerationKind::Newest).unwrap().version, 2);
        assert!(s.dir(GenerationKind::Temp).is_dir());
        assert_eq!(dropped_entries(&s.slot_dir(GenerationKind::Stable)), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_promotion_of_temp_restores_slots() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        populate(&s, GenerationKind::Stable, 1);
        populate(&s, GenerationKind::Temp, 3);
        nest_slot_inside(&s, GenerationKind::Newest, &s.dir(GenerationKind::Temp));
        populate(&s, GenerationKind::Newest, 2);

        assert!(matches!(s.promote(), Err(UpdateError::Storage { .. })));

        assert_eq!(s.validate(GenerationKind::Stable).unwrap().version, 1);
        assert_eq!(s.validate(GenerationKind::Newest).unwrap().version, 2);
        assert_eq!(s.resolve_active().unwrap().version, 2);
        assert!(s.dir(GenerationKind::Temp).is_dir());
        assert_eq!(dropped_entries(&s.slot_dir(GenerationKind::Stable)), 0);
    }

    #[test]
    fn test_prune_stale_detaches_old_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let old = GenerationStore::new(dir.path(), "100", "main.jsbundle");
        populate(&old, GenerationKind::Stable, 1);
        let s = GenerationStore::new(dir.path(), "200", "main.jsbundle");
        populate(&s, GenerationKind::Stable, 2);

        s.prune_stale();

        assert!(!old.dir(GenerationKind::Stable).exists());
        assert!(s.dir(GenerationKind::Stable).exists());
        let slot = s.slot_dir(GenerationKind::Stable);
        assert!(dropped_entries(&slot) <= 1);
    }
}
