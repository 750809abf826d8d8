use std::sync::Arc;
use tracing::{debug, info};

use crate::archive::ArchiveExtractor;
use crate::codec::PatchCodec;
use crate::error::{Result, UpdateError};
use crate::generation::{ActiveGeneration, GenerationKind, GenerationStore};
use crate::patch_format::PatchMeta;
use crate::util;

/// Turn the downloaded patch in `Temp` into the new `Newest` generation.
///
/// Decoding and extraction run on the blocking pool. Nothing outside `Temp` is touched
/// until every check has passed and the archive is unpacked; the final step is the
/// rename-based promotion. Returns the installed patch version.
pub async fn install_patch(
    store: GenerationStore,
    active: Option<ActiveGeneration>,
    codec: Arc<dyn PatchCodec>,
    extractor: Arc<dyn ArchiveExtractor>,
) -> Result<u32> {
    tokio::task::spawn_blocking(move || {
        let version = stage(&store, active.as_ref(), codec.as_ref(), extractor.as_ref())?;
        store.promote()?;
        info!(version, "patch installed");
        Ok(version)
    })
    .await
    .map_err(|e| UpdateError::Worker(format!("install task did not finish: {e}")))?
}

/// Steps before promotion: verify, decode, write and unpack the new assets archive.
fn stage(
    store: &GenerationStore,
    active: Option<&ActiveGeneration>,
    codec: &dyn PatchCodec,
    extractor: &dyn ArchiveExtractor,
) -> Result<u32> {
    let meta_path = store.meta_file(GenerationKind::Temp);
    let data_path = store.data_file(GenerationKind::Temp);
    for required in [&meta_path, &data_path] {
        if !required.is_file() {
            return Err(UpdateError::NoPatchFound(required.clone()));
        }
    }

    // Re-verified: the files may have changed on disk since the download.
    let meta = PatchMeta::load(&meta_path)?;
    meta.verify_header()?;
    let body = util::map_file(&data_path)?;
    meta.verify_checksum(&body)?;
    debug!(version = meta.version(), bytes = body.len(), "patch verified");

    let archive = match active {
        None => {
            debug!("no installed bundle, patch body is a full archive");
            codec.decompress(&body)?
        }
        Some(current) => {
            let assets_path = store.assets_file(current.kind);
            if !assets_path.is_file() {
                return Err(UpdateError::MissingLocalAssets(assets_path));
            }
            let base = util::map_file(&assets_path)?;
            let delta = codec.decompress(&body)?;
            debug!(
                base_version = current.version,
                base_bytes = base.len(),
                delta_bytes = delta.len(),
                "applying delta to installed assets"
            );
            codec.apply_patch(&base, &delta)?
        }
    };
    drop(body);

    let temp_dir = store.dir(GenerationKind::Temp);
    let assets_path = store.assets_file(GenerationKind::Temp);
    std::fs::write(&assets_path, &archive).map_err(|e| UpdateError::storage(&assets_path, e))?;
    let files = extractor.extract(&assets_path, &temp_dir)?;

    let bundle = store.bundle_file(GenerationKind::Temp);
    if !bundle.is_file() {
        return Err(UpdateError::Archive(format!(
            "assets archive has no {} bundle",
            store.bundle_name()
        )));
    }

    info!(version = meta.version(), files, "patch staged");
    Ok(meta.version())
}
