use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, UpdateError};
use crate::rolling_hash::RollingChecksum;

pub const BLOCK_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Reuse `len` bytes of the base starting at `offset`.
    Copy { offset: u64, len: u64 },
    /// Literal bytes absent from the base.
    Insert { data: Vec<u8> },
}

/// Serialized form of a delta. The target length and BLAKE3 hash let the decoder
/// reject a delta applied to the wrong base.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeltaFile {
    pub target_len: u64,
    pub target_hash: [u8; 32],
    pub ops: Vec<DeltaOp>,
}

impl DeltaFile {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| UpdateError::Codec(format!("encode delta: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| UpdateError::Codec(format!("decode delta: {e}")))
    }
}

struct BlockSignature {
    weak: u32,
    strong: blake3::Hash,
    offset: usize,
}

/// rsync-style block matching of `target` against `base`.
pub fn compute_delta(base: &[u8], target: &[u8]) -> DeltaFile {
    DeltaFile {
        target_len: target.len() as u64,
        target_hash: *blake3::hash(target).as_bytes(),
        ops: diff_ops(base, target),
    }
}

fn diff_ops(base: &[u8], target: &[u8]) -> Vec<DeltaOp> {
    if target.is_empty() {
        return Vec::new();
    }
    if base.is_empty() || target.len() < BLOCK_SIZE {
        return vec![DeltaOp::Insert {
            data: target.to_vec(),
        }];
    }

    let signatures: Vec<BlockSignature> = base
        .chunks(BLOCK_SIZE)
        .enumerate()
        .map(|(i, block)| BlockSignature {
            weak: RollingChecksum::over(block).value(),
            strong: blake3::hash(block),
            offset: i * BLOCK_SIZE,
        })
        .collect();

    let mut by_weak: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
    for (idx, sig) in signatures.iter().enumerate() {
        by_weak.entry(sig.weak).or_default().push(idx);
    }

    let mut ops = Vec::new();
    let mut literal = Vec::new();
    let mut pos = 0usize;
    let mut rolling = RollingChecksum::over(&target[..BLOCK_SIZE]);

    while pos + BLOCK_SIZE <= target.len() {
        let window = &target[pos..pos + BLOCK_SIZE];
        let hit = by_weak.get(&rolling.value()).and_then(|candidates| {
            let strong = blake3::hash(window);
            candidates
                .iter()
                .map(|&i| &signatures[i])
                .find(|sig| sig.strong == strong)
        });

        match hit {
            Some(sig) => {
                if !literal.is_empty() {
                    ops.push(DeltaOp::Insert {
                        data: std::mem::take(&mut literal),
                    });
                }
                let len = (base.len() - sig.offset).min(BLOCK_SIZE);
                push_copy(&mut ops, sig.offset as u64, len as u64);
                pos += len;
                if pos + BLOCK_SIZE <= target.len() {
                    rolling = RollingChecksum::over(&target[pos..pos + BLOCK_SIZE]);
                }
            }
            None => {
                literal.push(target[pos]);
                pos += 1;
                if pos + BLOCK_SIZE <= target.len() {
                    rolling.roll(target[pos - 1], target[pos + BLOCK_SIZE - 1]);
                }
            }
        }
    }

    literal.extend_from_slice(&target[pos..]);
    if !literal.is_empty() {
        ops.push(DeltaOp::Insert { data: literal });
    }
    ops
}

/// Adjacent copies are merged so an unchanged archive encodes as a single op.
fn push_copy(ops: &mut Vec<DeltaOp>, offset: u64, len: u64) {
    if let Some(DeltaOp::Copy {
        offset: prev_offset,
        len: prev_len,
    }) = ops.last_mut()
    {
        if *prev_offset + *prev_len == offset {
            *prev_len += len;
            return;
        }
    }
    ops.push(DeltaOp::Copy { offset, len });
}

/// Rebuild the target from `base`. Out-of-range copies and a result that does not
/// match the recorded length or hash are codec failures, never panics.
pub fn apply_delta(base: &[u8], delta: &DeltaFile) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(delta.target_len.min(1 << 30) as usize);

    for op in &delta.ops {
        match op {
            DeltaOp::Copy { offset, len } => {
                let range = usize::try_from(*offset)
                    .ok()
                    .zip(usize::try_from(*len).ok())
                    .and_then(|(start, len)| Some(start..start.checked_add(len)?))
                    .filter(|r| r.end <= base.len())
                    .ok_or_else(|| {
                        UpdateError::Codec(format!(
                            "copy of {len} bytes at {offset} exceeds base of {} bytes",
                            base.len()
                        ))
                    })?;
                out.extend_from_slice(&base[range]);
            }
            DeltaOp::Insert { data } => out.extend_from_slice(data),
        }
    }

    if out.len() as u64 != delta.target_len {
        return Err(UpdateError::Codec(format!(
            "delta produced {} bytes, expected {}",
            out.len(),
            delta.target_len
        )));
    }
    if *blake3::hash(&out).as_bytes() != delta.target_hash {
        return Err(UpdateError::Codec(
            "patched archive hash mismatch; delta does not belong to this base".to_string(),
        ));
    }
    Ok(out)
}
