use std::collections::HashMap;

use bytes::Bytes;

use crate::bitmap::Bitmap;
use crate::error::{PoolError, PoolResult};
use crate::segment::{SegmentMeta, SegmentState, SegmentStatus};

/// Bookkeeping for one in-flight upload.
///
/// The slice table is fixed at creation; progress is a bitmap over segment
/// indices plus per-segment state keyed by segment id. An upload is
/// complete when every segment, parity included, has been acknowledged by
/// at least one peer.
#[derive(Debug)]
pub struct UploadTask {
    task_id: String,
    data_segments: usize,
    bitmap: Bitmap,
    segments: HashMap<String, SegmentState>,
    index_to_id: Vec<String>,
    paused: bool,
    cancelled: bool,
    private_key: Bytes,
    file_metadata: Bytes,
}

impl UploadTask {
    pub(crate) fn new(
        task_id: String,
        metas: Vec<SegmentMeta>,
        data_segments: usize,
        private_key: Bytes,
        file_metadata: Bytes,
    ) -> PoolResult<Self> {
        let total = metas.len();
        let mut index_to_id = vec![String::new(); total];
        let mut segments = HashMap::with_capacity(total);
        for meta in metas {
            if meta.index >= total {
                return Err(PoolError::IndexOutOfRange {
                    task_id: task_id.clone(),
                    index: meta.index,
                    total,
                });
            }
            index_to_id[meta.index] = meta.segment_id.clone();
            segments.insert(meta.segment_id.clone(), SegmentState::new(meta));
        }
        Ok(Self {
            task_id,
            data_segments,
            bitmap: Bitmap::new(total),
            segments,
            index_to_id,
            paused: false,
            cancelled: false,
            private_key,
            file_metadata,
        })
    }

    /// Task identifier.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Total segment count, parity included.
    #[must_use]
    pub const fn total_segments(&self) -> usize {
        self.bitmap.len()
    }

    /// Number of data segments.
    #[must_use]
    pub const fn data_segments(&self) -> usize {
        self.data_segments
    }

    /// Number of parity segments.
    #[must_use]
    pub const fn parity_segments(&self) -> usize {
        self.total_segments() - self.data_segments
    }

    /// Signing key supplied at submission; opaque to the pool.
    #[must_use]
    pub const fn private_key(&self) -> &Bytes {
        &self.private_key
    }

    /// File metadata supplied at submission; opaque to the pool.
    #[must_use]
    pub const fn file_metadata(&self) -> &Bytes {
        &self.file_metadata
    }

    /// Whether the driver should hold off scheduling.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    pub(crate) const fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Whether the task was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub(crate) const fn set_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Whether every segment has at least one holder.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.bitmap.all_set()
    }

    /// Fraction of required placements done, in percent.
    #[must_use]
    pub fn progress_percent(&self) -> f64 {
        if self.total_segments() == 0 {
            return 100.0;
        }
        self.bitmap.count_set() as f64 * 100.0 / self.total_segments() as f64
    }

    /// Looks up a segment by id.
    #[must_use]
    pub fn segment(&self, segment_id: &str) -> Option<&SegmentState> {
        self.segments.get(segment_id)
    }

    pub(crate) fn segment_mut(&mut self, segment_id: &str) -> PoolResult<&mut SegmentState> {
        let task_id = self.task_id.clone();
        self.segments
            .get_mut(segment_id)
            .ok_or_else(|| PoolError::UnknownSegment {
                task_id,
                segment_id: segment_id.to_owned(),
            })
    }

    /// Segment id at `index`.
    #[must_use]
    pub fn segment_id_at(&self, index: usize) -> Option<&str> {
        self.index_to_id.get(index).map(String::as_str)
    }

    /// Marks the segment at `index` completed; returns `true` when the
    /// whole task just became complete.
    pub(crate) fn mark_completed(&mut self, index: usize) -> PoolResult<bool> {
        if index >= self.total_segments() {
            return Err(PoolError::IndexOutOfRange {
                task_id: self.task_id.clone(),
                index,
                total: self.total_segments(),
            });
        }
        let segment_id = self.index_to_id[index].clone();
        self.segments
            .get_mut(&segment_id)
            .ok_or_else(|| PoolError::UnknownSegment {
                task_id: self.task_id.clone(),
                segment_id,
            })?
            .transition(SegmentStatus::Completed)?;
        self.bitmap.set(index);
        Ok(self.is_complete())
    }

    /// Segment ids still lacking a holder, in index order.
    #[must_use]
    pub fn incomplete_pieces(&self) -> Vec<String> {
        (0..self.total_segments())
            .filter(|index| !self.bitmap.is_set(*index))
            .map(|index| self.index_to_id[index].clone())
            .collect()
    }

    /// Iterates all segment states.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentState> {
        self.segments.values()
    }
}
