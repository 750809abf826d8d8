//! Lays out patches for a static file server.
//!
//! ```text
//! <root>/<platform>/newest/base        full archive of the newest version (header + zstd tar)
//! <root>/<platform>/newest/assets.tar
//! <root>/<platform>/<v>/patch          delta from version v to the newest version
//! <root>/<platform>/<v>/assets.tar
//! ```

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::archive;
use crate::codec::ZstdDeltaCodec;
use crate::error::{Result, UpdateError};
use crate::patch_format::{encode_patch, PatchMeta, ASSETS_FILE, HEADER_LEN};

const NEWEST_DIR: &str = "newest";
const STAGING_DIR: &str = ".newest.staging";
const BASE_FILE: &str = "base";
const PATCH_FILE: &str = "patch";

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub assets_dir: PathBuf,
    pub server_root: PathBuf,
    pub platform: String,
    pub bundle_name: String,
    /// Defaults to one past the highest published version.
    pub version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSummary {
    pub version: u32,
    pub patches_built: usize,
    pub archive_size: u64,
}

pub fn publish(options: &PublishOptions) -> Result<PublishSummary> {
    let bundle = options.assets_dir.join(&options.bundle_name);
    if !bundle.is_file() {
        return Err(UpdateError::Config(format!(
            "{} does not contain the bundle {}",
            options.assets_dir.display(),
            options.bundle_name
        )));
    }

    let platform_dir = options.server_root.join(&options.platform);
    std::fs::create_dir_all(&platform_dir).map_err(|e| UpdateError::storage(&platform_dir, e))?;

    let newest_dir = platform_dir.join(NEWEST_DIR);
    let newest_version = if newest_dir.is_dir() {
        Some(published_version(&newest_dir)?)
    } else {
        None
    };

    let mut sources = numbered_versions(&platform_dir)?;
    if let Some(v) = newest_version {
        if sources.iter().any(|(n, _)| *n == v) {
            return Err(UpdateError::Config(format!(
                "version {v} is published both as newest and as a numbered directory"
            )));
        }
        sources.push((v, newest_dir.clone()));
    }

    let highest = sources.iter().map(|(v, _)| *v).max();
    let version = options.version.unwrap_or_else(|| highest.map_or(1, |h| h + 1));
    if let Some(highest) = highest {
        if version <= highest {
            return Err(UpdateError::Stale {
                remote: version,
                local: highest,
            });
        }
    }

    let archive = archive::pack_directory(&options.assets_dir)?;
    let codec = ZstdDeltaCodec;

    // Older versions get a delta to the new archive.
    let built: Vec<u32> = sources
        .par_iter()
        .filter(|(_, dir)| dir.join(ASSETS_FILE).is_file())
        .map(|(from, dir)| -> Result<u32> {
            let base_path = dir.join(ASSETS_FILE);
            let base = std::fs::read(&base_path).map_err(|e| UpdateError::storage(&base_path, e))?;
            let body = codec.diff(&base, &archive)?;
            write_atomic(&dir.join(PATCH_FILE), &encode_patch(version, &body))?;
            info!(from, to = version, bytes = body.len(), "delta patch built");
            Ok(*from)
        })
        .collect::<Result<Vec<_>>>()?;

    let staging = platform_dir.join(STAGING_DIR);
    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(|e| UpdateError::storage(&staging, e))?;
    }
    std::fs::create_dir_all(&staging).map_err(|e| UpdateError::storage(&staging, e))?;
    write_atomic(&staging.join(ASSETS_FILE), &archive)?;
    let full = codec.compress(&archive)?;
    write_atomic(&staging.join(BASE_FILE), &encode_patch(version, &full))?;

    if let Some(previous) = newest_version {
        let retired = platform_dir.join(previous.to_string());
        std::fs::rename(&newest_dir, &retired).map_err(|e| UpdateError::storage(&newest_dir, e))?;
    }
    std::fs::rename(&staging, &newest_dir).map_err(|e| UpdateError::storage(&staging, e))?;

    info!(version, patches = built.len(), "published");
    Ok(PublishSummary {
        version,
        patches_built: built.len(),
        archive_size: archive.len() as u64,
    })
}

/// Version recorded in a published `base` header.
fn published_version(dir: &Path) -> Result<u32> {
    let base = dir.join(BASE_FILE);
    let bytes = std::fs::read(&base).map_err(|e| UpdateError::storage(&base, e))?;
    let header = bytes.get(..HEADER_LEN).unwrap_or(&bytes);
    let meta = PatchMeta::parse(header)?;
    meta.verify_header()?;
    Ok(meta.version())
}

fn numbered_versions(platform_dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let entries = std::fs::read_dir(platform_dir).map_err(|e| UpdateError::storage(platform_dir, e))?;
    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| UpdateError::storage(platform_dir, e))?;
        let path = entry.path();
        let Some(version) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if path.is_dir() {
            versions.push((version, path));
        }
    }
    versions.sort_by_key(|(v, _)| *v);
    Ok(versions)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, data).map_err(|e| UpdateError::storage(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| UpdateError::storage(path, e))
}
