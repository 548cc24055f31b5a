use bytes::Bytes;
use pool::SegmentMeta;
use sha2::{Digest, Sha256};

/// Derives the stable identifier of a segment.
///
/// The digest binds the file, the position and the bytes, so a downloader
/// holding the slice table can verify received content without trusting
/// the serving peer: `segment_id(file_id, index, content)` must equal the
/// id it asked for.
#[must_use]
pub fn segment_id(file_id: &str, index: usize, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_id.as_bytes());
    hasher.update((index as u64).to_be_bytes());
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Splits `data` into fixed-size shards, zero-padding the tail.
///
/// Every shard has exactly `segment_size` bytes so the erasure coder can
/// operate on them directly; the true file length travels in the manifest
/// and recovers the original on reassembly.
#[must_use]
pub fn split_padded(data: &[u8], segment_size: usize) -> Vec<Vec<u8>> {
    assert!(segment_size > 0, "segment size must be positive");
    data.chunks(segment_size)
        .map(|chunk| {
            let mut shard = vec![0u8; segment_size];
            shard[..chunk.len()].copy_from_slice(chunk);
            shard
        })
        .collect()
}

/// Everything a downloader needs to recover a file.
///
/// Produced by the upload driver and stored out-of-band (the metadata
/// layer is not part of the transfer core).
#[derive(Clone, Debug)]
pub struct FileManifest {
    /// Stable identifier of the file.
    pub file_id: String,
    /// True byte length before padding.
    pub file_len: u64,
    /// Shard size used when splitting.
    pub segment_size: usize,
    /// Number of data segments (the recovery threshold).
    pub data_segments: usize,
    /// Slice table: segment identity per index, data first, then parity.
    pub segments: Vec<SegmentMeta>,
}

impl FileManifest {
    /// Total segment count, parity included.
    #[must_use]
    pub fn total_segments(&self) -> usize {
        self.segments.len()
    }

    /// Number of parity segments.
    #[must_use]
    pub fn parity_segments(&self) -> usize {
        self.total_segments() - self.data_segments
    }
}

/// Builds the slice table for a set of encoded shards.
#[must_use]
pub fn build_slice_table(file_id: &str, shards: &[Vec<u8>], data_segments: usize) -> Vec<SegmentMeta> {
    shards
        .iter()
        .enumerate()
        .map(|(index, shard)| SegmentMeta {
            segment_id: segment_id(file_id, index, shard),
            index,
            is_parity: index >= data_segments,
        })
        .collect()
}

/// Reassembles data shards into the original file bytes.
#[must_use]
pub fn reassemble(data_shards: Vec<Vec<u8>>, file_len: u64) -> Bytes {
    let mut out = Vec::with_capacity(data_shards.iter().map(Vec::len).sum());
    for shard in data_shards {
        out.extend_from_slice(&shard);
    }
    out.truncate(usize::try_from(file_len).unwrap_or(usize::MAX));
    Bytes::from(out)
}
