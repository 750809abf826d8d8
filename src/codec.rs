use crate::delta::{self, DeltaFile};
use crate::error::{Result, UpdateError};

const COMPRESSION_LEVEL: i32 = 19;

/// The decompress / diff-apply transform the installer runs on a patch body.
pub trait PatchCodec: Send + Sync {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn apply_patch(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>>;
}

/// zstd frames around either a whole assets archive or a bincode [`DeltaFile`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdDeltaCodec;

impl ZstdDeltaCodec {
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(data, COMPRESSION_LEVEL)
            .map_err(|e| UpdateError::Codec(format!("zstd compress: {e}")))
    }

    /// Compressed delta turning `base` into `target`, ready to be sealed as a patch body.
    pub fn diff(&self, base: &[u8], target: &[u8]) -> Result<Vec<u8>> {
        let encoded = delta::compute_delta(base, target).encode()?;
        self.compress(&encoded)
    }
}

impl PatchCodec for ZstdDeltaCodec {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        // Streaming decode: frames written by other encoders may omit the content size.
        zstd::stream::decode_all(data).map_err(|e| UpdateError::Codec(format!("zstd decompress: {e}")))
    }

    fn apply_patch(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
        let delta = DeltaFile::decode(delta)?;
        delta::apply_delta(base, &delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_archive_roundtrip() {
        let codec = ZstdDeltaCodec;
        let archive = vec![7u8; 50_000];
        let body = codec.compress(&archive).unwrap();
        assert!(body.len() < archive.len());
        assert_eq!(codec.decompress(&body).unwrap(), archive);
    }

    #[test]
    fn test_diff_then_apply() {
        let codec = ZstdDeltaCodec;
        let base: Vec<u8> = (0..20_000u32).map(|i| (i % 199) as u8).collect();
        let mut target = base.clone();
        target.extend_from_slice(b"appended in the new release");

        let body = codec.diff(&base, &target).unwrap();
        let delta = codec.decompress(&body).unwrap();
        assert_eq!(codec.apply_patch(&base, &delta).unwrap(), target);
    }

    #[test]
    fn test_decompress_garbage_is_codec_error() {
        let err = ZstdDeltaCodec.decompress(b"definitely not zstd").unwrap_err();
        assert!(matches!(err, UpdateError::Codec(_)));
    }
}
