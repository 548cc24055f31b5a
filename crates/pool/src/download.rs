use std::collections::HashMap;

use crate::bitmap::Bitmap;
use crate::error::{PoolError, PoolResult};
use crate::segment::{SegmentMeta, SegmentState, SegmentStatus};

/// Bookkeeping for one in-flight download.
///
/// Unlike uploads, a download does not need every segment: any
/// `data_segments` of the `total` segments reconstruct the file, so the
/// completion check counts set bits rather than requiring all of them.
#[derive(Debug)]
pub struct DownloadTask {
    task_id: String,
    file_id: String,
    data_segments: usize,
    bitmap: Bitmap,
    segments: Vec<SegmentState>,
    id_to_index: HashMap<String, usize>,
    paused: bool,
    cancelled: bool,
}

impl DownloadTask {
    pub(crate) fn new(
        task_id: String,
        file_id: String,
        mut metas: Vec<SegmentMeta>,
        data_segments: usize,
    ) -> PoolResult<Self> {
        let total = metas.len();
        metas.sort_by_key(|meta| meta.index);
        let mut segments = Vec::with_capacity(total);
        let mut id_to_index = HashMap::with_capacity(total);
        for (position, meta) in metas.into_iter().enumerate() {
            if meta.index != position {
                return Err(PoolError::IndexOutOfRange {
                    task_id: task_id.clone(),
                    index: meta.index,
                    total,
                });
            }
            id_to_index.insert(meta.segment_id.clone(), meta.index);
            segments.push(SegmentState::new(meta));
        }
        Ok(Self {
            task_id,
            file_id,
            data_segments,
            bitmap: Bitmap::new(total),
            segments,
            id_to_index,
            paused: false,
            cancelled: false,
        })
    }

    /// Task identifier.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// File being recovered.
    #[must_use]
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Total segment count, parity included.
    #[must_use]
    pub const fn total_segments(&self) -> usize {
        self.bitmap.len()
    }

    /// Segments required for reconstruction.
    #[must_use]
    pub const fn data_segments(&self) -> usize {
        self.data_segments
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

    /// Whether enough segments arrived to reconstruct.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.bitmap.count_set() >= self.data_segments
    }

    /// Fraction of required segments recovered, in percent.
    #[must_use]
    pub fn progress_percent(&self) -> f64 {
        if self.data_segments == 0 {
            return 100.0;
        }
        (self.bitmap.count_set().min(self.data_segments)) as f64 * 100.0
            / self.data_segments as f64
    }

    /// Segment state at `index`.
    #[must_use]
    pub fn segment_at(&self, index: usize) -> Option<&SegmentState> {
        self.segments.get(index)
    }

    /// Looks up a segment by id.
    #[must_use]
    pub fn segment(&self, segment_id: &str) -> Option<&SegmentState> {
        self.id_to_index
            .get(segment_id)
            .and_then(|index| self.segments.get(*index))
    }

    pub(crate) fn segment_mut(&mut self, segment_id: &str) -> PoolResult<&mut SegmentState> {
        let index = *self
            .id_to_index
            .get(segment_id)
            .ok_or_else(|| PoolError::UnknownSegment {
                task_id: self.task_id.clone(),
                segment_id: segment_id.to_owned(),
            })?;
        Ok(&mut self.segments[index])
    }

    /// Marks the segment at `index` recovered; returns `true` when enough
    /// segments just became available.
    pub(crate) fn mark_completed(&mut self, index: usize) -> PoolResult<bool> {
        if index >= self.total_segments() {
            return Err(PoolError::IndexOutOfRange {
                task_id: self.task_id.clone(),
                index,
                total: self.total_segments(),
            });
        }
        self.segments[index].transition(SegmentStatus::Completed)?;
        self.bitmap.set(index);
        Ok(self.is_complete())
    }

    /// Whether the segment at `index` was recovered.
    #[must_use]
    pub fn is_recovered(&self, index: usize) -> bool {
        self.bitmap.is_set(index)
    }

    /// Segment ids still worth fetching, data segments before parity.
    ///
    /// Preferring data segments keeps reconstruction cheap: if all data
    /// arrives, decode is a no-op concatenation.
    #[must_use]
    pub fn incomplete_pieces(&self) -> Vec<String> {
        let unset = |parity: bool| {
            self.segments
                .iter()
                .filter(move |s| s.meta().is_parity == parity)
                .filter(|s| !self.bitmap.is_set(s.meta().index))
                .map(|s| s.meta().segment_id.clone())
        };
        unset(false).chain(unset(true)).collect()
    }

    /// Explicit reset for the retry-after-failure path: clears the bitmap
    /// and requeues every non-completed segment.
    pub(crate) fn reset_progress(&mut self) {
        self.bitmap.clear_all();
        for segment in &mut self.segments {
            // Completed segments stay completed; their bits are restored.
            if segment.status() == SegmentStatus::Completed {
                self.bitmap.set(segment.meta().index);
            } else {
                let _ = segment.transition(SegmentStatus::Pending);
            }
        }
    }

    /// Iterates all segment states in index order.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentState> {
        self.segments.iter()
    }
}
