use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{Result, UpdateError};

pub const HEADER_LEN: usize = 64;
pub const PACK_VERSION: u8 = 1;

const VERSION_OFFSET: usize = 1;
const VERSION_LEN: usize = 4;
const CHECKSUM_OFFSET: usize = VERSION_OFFSET + VERSION_LEN;
const CHECKSUM_LEN: usize = 32;

/// File names inside a generation directory.
pub const META_FILE: &str = "patch.meta";
pub const DATA_FILE: &str = "patch.data";
pub const ASSETS_FILE: &str = "assets.tar";

/// The fixed 64-byte header that precedes every patch body.
///
/// Layout: pack version (1), patch version (4, big-endian), SHA-256 checksum (32),
/// reserved (27).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchMeta {
    bytes: [u8; HEADER_LEN],
}

impl PatchMeta {
    /// Wrap raw header bytes. Only the length is checked here.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; HEADER_LEN] = bytes.try_into().map_err(|_| {
            UpdateError::Corrupt(format!(
                "patch header is {} bytes, expected {}",
                bytes.len(),
                HEADER_LEN
            ))
        })?;
        Ok(Self { bytes })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| UpdateError::storage(path, e))?;
        Self::parse(&bytes)
    }

    /// Build a header for `body` with its checksum filled in.
    pub fn seal(version: u32, body: &[u8]) -> Self {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = PACK_VERSION;
        bytes[VERSION_OFFSET..CHECKSUM_OFFSET].copy_from_slice(&version.to_be_bytes());
        let mut meta = Self { bytes };
        let digest = meta.digest(body);
        meta.bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].copy_from_slice(&digest);
        meta
    }

    pub fn pack_version(&self) -> u8 {
        self.bytes[0]
    }

    pub fn version(&self) -> u32 {
        let mut raw = [0u8; VERSION_LEN];
        raw.copy_from_slice(&self.bytes[VERSION_OFFSET..CHECKSUM_OFFSET]);
        u32::from_be_bytes(raw)
    }

    pub fn checksum(&self) -> &[u8] {
        &self.bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.bytes
    }

    /// Exact match only: older pack versions never existed, newer ones are unknown.
    pub fn verify_header(&self) -> Result<()> {
        if self.pack_version() != PACK_VERSION {
            return Err(UpdateError::UnsupportedPackVersion(self.pack_version()));
        }
        Ok(())
    }

    pub fn verify_checksum(&self, body: &[u8]) -> Result<()> {
        let actual = self.digest(body);
        if actual.as_slice() != self.checksum() {
            tracing::debug!(
                expected = %hex::encode(self.checksum()),
                actual = %hex::encode(actual),
                "patch checksum mismatch"
            );
            return Err(UpdateError::Integrity);
        }
        Ok(())
    }

    /// SHA-256 over `header[0..5] ++ [0; 32] ++ body`. The reserved tail is not hashed.
    fn digest(&self, body: &[u8]) -> [u8; CHECKSUM_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes[..CHECKSUM_OFFSET]);
        hasher.update([0u8; CHECKSUM_LEN]);
        hasher.update(body);
        hasher.finalize().into()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.bytes).map_err(|e| UpdateError::storage(path, e))
    }
}

/// A full patch as served over the wire: header followed by body.
pub fn encode_patch(version: u32, body: &[u8]) -> Vec<u8> {
    let meta = PatchMeta::seal(version, body);
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(meta.as_bytes());
    out.extend_from_slice(body);
    out
}
