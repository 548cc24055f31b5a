use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{EngineError, EngineResult};

fn coder(data_segments: usize, parity_segments: usize) -> EngineResult<ReedSolomon> {
    ReedSolomon::new(data_segments, parity_segments)
        .map_err(|e| EngineError::Erasure(format!("({data_segments}, {parity_segments}): {e}")))
}

/// Extends equal-length data shards with `parity_segments` parity shards.
///
/// Returns the full shard vector, data first.
pub fn encode(data_shards: Vec<Vec<u8>>, parity_segments: usize) -> EngineResult<Vec<Vec<u8>>> {
    let data_segments = data_shards.len();
    if data_segments == 0 {
        return Err(EngineError::Erasure("no data shards to encode".into()));
    }
    let shard_len = data_shards[0].len();
    if data_shards.iter().any(|shard| shard.len() != shard_len) {
        return Err(EngineError::Erasure("data shards differ in length".into()));
    }

    let rs = coder(data_segments, parity_segments)?;
    let mut shards = data_shards;
    shards.resize(data_segments + parity_segments, vec![0u8; shard_len]);
    rs.encode(&mut shards)
        .map_err(|e| EngineError::Erasure(e.to_string()))?;
    Ok(shards)
}

/// Rebuilds the original data shards from any sufficient subset.
///
/// `shards` is indexed by segment position with `None` for missing
/// entries; at least `data_segments` of them must be present. Returns the
/// first `data_segments` shards, reconstructed where necessary.
pub fn reconstruct(
    mut shards: Vec<Option<Vec<u8>>>,
    data_segments: usize,
    parity_segments: usize,
) -> EngineResult<Vec<Vec<u8>>> {
    let present = shards.iter().filter(|s| s.is_some()).count();
    if present < data_segments {
        return Err(EngineError::DownloadIncomplete {
            recovered: present,
            required: data_segments,
        });
    }

    let rs = coder(data_segments, parity_segments)?;
    rs.reconstruct_data(&mut shards)
        .map_err(|e| EngineError::Erasure(e.to_string()))?;

    shards
        .into_iter()
        .take(data_segments)
        .map(|shard| shard.ok_or_else(|| EngineError::Erasure("reconstruction left a hole".into())))
        .collect()
}
