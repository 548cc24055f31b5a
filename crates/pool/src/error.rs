use thiserror::Error;

use crate::segment::SegmentStatus;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by the task pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A task with this id is already registered.
    #[error("task {0} already exists")]
    DuplicateTask(String),
    /// No task with this id.
    #[error("unknown task {0}")]
    UnknownTask(String),
    /// The task exists but does not contain the segment.
    #[error("task {task_id} has no segment {segment_id}")]
    UnknownSegment {
        /// Owning task.
        task_id: String,
        /// Missing segment.
        segment_id: String,
    },
    /// Segment index outside the task layout.
    #[error("index {index} out of range for task {task_id} ({total} segments)")]
    IndexOutOfRange {
        /// Owning task.
        task_id: String,
        /// Offending index.
        index: usize,
        /// Segment count of the task.
        total: usize,
    },
    /// Illegal segment status transition.
    #[error("segment {segment_id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        /// Affected segment.
        segment_id: String,
        /// Current status.
        from: SegmentStatus,
        /// Requested status.
        to: SegmentStatus,
    },
    /// Operation requires a download task but found an upload, or vice
    /// versa.
    #[error("task {task_id} is not a {expected} task")]
    WrongKind {
        /// Affected task.
        task_id: String,
        /// Kind the operation needed.
        expected: &'static str,
    },
}
