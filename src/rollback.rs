use tracing::{error, info, warn};

use crate::generation::{ActiveGeneration, GenerationStore};

/// Move the suspect generation out of the way so the next resolution falls back to
/// the previous one, or to the host's bundled asset when nothing valid remains.
///
/// `false` means the rename failed and the bundle cannot be swapped; the host should
/// fall back to its default crash handling.
pub fn rollback(store: &GenerationStore, active: &ActiveGeneration) -> bool {
    if !active.dir.exists() {
        warn!(dir = %active.dir.display(), "active generation already gone, nothing to roll back");
        return true;
    }

    match store.demote(active.kind) {
        Ok(_) => {
            info!(generation = %active.kind, version = active.version, "rolled back");
            true
        }
        Err(e) => {
            error!(generation = %active.kind, error = %e, "rollback failed");
            false
        }
    }
}
