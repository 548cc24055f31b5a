use std::io;

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Numeric code attached to every [`ProtocolError`], stable for logs and
/// metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Frame length header outside the accepted range.
    InvalidLength = 1001,
    /// An operation exceeded its deadline.
    Timeout = 1002,
    /// Failure while encoding a message.
    Serialize = 1003,
    /// Failure while decoding a message.
    Deserialize = 1004,
    /// Transport read failure.
    Read = 1005,
    /// Transport write failure.
    Write = 1006,
    /// Dial or socket-level failure.
    Connection = 1007,
    /// A panic was captured inside an I/O driver.
    Panic = 1008,
    /// Too many heartbeats missed.
    Heartbeat = 1009,
    /// Reconnect attempts exhausted.
    Reconnect = 1010,
    /// Envelope checksum mismatch.
    Checksum = 1011,
    /// Unsupported wire version.
    Version = 1012,
    /// Duplicate or otherwise rejected sequence number.
    Sequence = 1013,
    /// Message timestamp older than the acceptance window.
    MessageAge = 1014,
    /// Handshake refused or malformed.
    Handshake = 1015,
    /// Flow-control budget could not be acquired.
    FlowControl = 1016,
    /// Send queue rejected a message.
    QueueFull = 1017,
    /// Compression failure.
    Compression = 1018,
    /// Payload exceeds negotiated size limits.
    Size = 1019,
}

impl ErrorCode {
    /// Numeric representation used in logs.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Error produced by the wire-protocol layer.
///
/// Recoverable transport failures (timeouts, read/write errors, heartbeat
/// loss) may be retried with backoff; integrity and resource failures are
/// surfaced immediately.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame length header outside `[minimum, max_message_size]`.
    #[error("invalid frame length {actual} (limit {limit})")]
    InvalidLength {
        /// Length read from the header.
        actual: u64,
        /// Configured maximum.
        limit: u64,
    },
    /// Deadline expired.
    #[error("{operation} timed out")]
    Timeout {
        /// Operation that expired.
        operation: &'static str,
    },
    /// Encoding failure.
    #[error("serialize failed: {0}")]
    Serialize(String),
    /// Decoding failure.
    #[error("deserialize failed: {0}")]
    Deserialize(String),
    /// Read-side I/O failure.
    #[error("read failed")]
    Read(#[source] io::Error),
    /// Write-side I/O failure.
    #[error("write failed")]
    Write(#[source] io::Error),
    /// Socket-level failure (dial, reset, closed).
    #[error("connection failed: {0}")]
    Connection(String),
    /// Captured panic inside an I/O driver.
    #[error("panic in protocol driver: {0}")]
    Panic(String),
    /// Heartbeat loss beyond the tolerated count.
    #[error("missed {missed} heartbeats")]
    Heartbeat {
        /// Consecutive heartbeats missed.
        missed: u32,
    },
    /// Reconnect attempts exhausted.
    #[error("reconnect failed after {attempts} attempts")]
    Reconnect {
        /// Attempts performed.
        attempts: u32,
    },
    /// Envelope checksum mismatch.
    #[error("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    Checksum {
        /// Checksum carried by the envelope.
        expected: u32,
        /// Checksum recomputed from the body.
        computed: u32,
    },
    /// Unsupported wire version.
    #[error("unsupported protocol version {received} (supported {supported})")]
    Version {
        /// Version received from the peer.
        received: u16,
        /// Version this node speaks.
        supported: u16,
    },
    /// Sequence number rejected by the tracker.
    #[error("sequence {sequence} rejected as duplicate")]
    Sequence {
        /// The rejected sequence number.
        sequence: u64,
    },
    /// Message older than the acceptance window.
    #[error("message is {age_secs}s old, limit {limit_secs}s")]
    MessageAge {
        /// Observed age in seconds.
        age_secs: u64,
        /// Configured limit in seconds.
        limit_secs: u64,
    },
    /// Handshake refused or malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Flow-control budget not obtainable.
    #[error("flow control budget exhausted")]
    FlowControl,
    /// Bounded send queue rejected the message.
    #[error("send queue full")]
    QueueFull,
    /// Payload exceeds the negotiated size limit.
    #[error("payload of {actual} bytes exceeds limit {limit}")]
    Size {
        /// Payload size.
        actual: usize,
        /// Configured limit.
        limit: usize,
    },
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::Timeout { operation: "io" },
            io::ErrorKind::WriteZero | io::ErrorKind::BrokenPipe => Self::Write(err),
            _ => Self::Read(err),
        }
    }
}

impl ProtocolError {
    /// Stable numeric code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidLength { .. } => ErrorCode::InvalidLength,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Serialize(_) => ErrorCode::Serialize,
            Self::Deserialize(_) => ErrorCode::Deserialize,
            Self::Read(_) => ErrorCode::Read,
            Self::Write(_) => ErrorCode::Write,
            Self::Connection(_) => ErrorCode::Connection,
            Self::Panic(_) => ErrorCode::Panic,
            Self::Heartbeat { .. } => ErrorCode::Heartbeat,
            Self::Reconnect { .. } => ErrorCode::Reconnect,
            Self::Checksum { .. } => ErrorCode::Checksum,
            Self::Version { .. } => ErrorCode::Version,
            Self::Sequence { .. } => ErrorCode::Sequence,
            Self::MessageAge { .. } => ErrorCode::MessageAge,
            Self::Handshake(_) => ErrorCode::Handshake,
            Self::FlowControl => ErrorCode::FlowControl,
            Self::QueueFull => ErrorCode::QueueFull,
            Self::Size { .. } => ErrorCode::Size,
        }
    }

    /// Whether retrying with backoff is reasonable.
    ///
    /// Integrity failures (checksum, version, length, serialization) are
    /// never retried: resending the same bytes cannot fix them.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Read(_)
                | Self::Write(_)
                | Self::Connection(_)
                | Self::Heartbeat { .. }
        )
    }
}
