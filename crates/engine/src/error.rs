use std::io;

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the transfer drivers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Wire-protocol failure that exhausted its retries.
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),
    /// Task-pool bookkeeping failure.
    #[error(transparent)]
    Pool(#[from] pool::PoolError),
    /// Socket or blob-store I/O failure.
    #[error("i/o failure")]
    Io(#[from] io::Error),
    /// Erasure encoder or decoder failure.
    #[error("erasure coding failed: {0}")]
    Erasure(String),
    /// Invalid transfer configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The routing table produced no eligible peer for a segment.
    #[error("no candidate peers for segment {segment_id}")]
    NoCandidates {
        /// Affected segment.
        segment_id: String,
    },
    /// A single segment exhausted its retry budget.
    #[error("segment {segment_id} failed after {attempts} attempts")]
    SegmentFailed {
        /// Affected segment.
        segment_id: String,
        /// Attempts performed.
        attempts: u32,
    },
    /// Upload finished with unplaced segments.
    #[error("upload incomplete: {failed} of {total} segments unplaced")]
    UploadIncomplete {
        /// Segments without a holder.
        failed: usize,
        /// Total segments in the task.
        total: usize,
    },
    /// Download ran out of candidates below the recovery threshold.
    #[error("download incomplete: recovered {recovered} of {required} required segments")]
    DownloadIncomplete {
        /// Segments recovered and verified.
        recovered: usize,
        /// Segments needed for reconstruction.
        required: usize,
    },
    /// The serving peer answered with an application error code.
    #[error("peer rejected request ({code:?}): {message}")]
    Rejected {
        /// Error class from the wire.
        code: protocol::SegmentErrorCode,
        /// Detail from the wire.
        message: String,
    },
    /// Received content whose digest does not match its segment id.
    #[error("segment {segment_id} failed content verification")]
    Verification {
        /// Affected segment.
        segment_id: String,
    },
    /// The task was cancelled while the driver was running.
    #[error("task {task_id} cancelled")]
    Cancelled {
        /// Cancelled task.
        task_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_convert_transparently() {
        let err: EngineError = protocol::ProtocolError::QueueFull.into();
        assert!(matches!(err, EngineError::Protocol(_)));
        assert_eq!(err.to_string(), "send queue full");
    }

    #[test]
    fn counts_show_in_messages() {
        let err = EngineError::DownloadIncomplete {
            recovered: 3,
            required: 4,
        };
        assert!(err.to_string().contains("3 of 4"));
    }
}
