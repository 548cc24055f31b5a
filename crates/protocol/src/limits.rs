//! Protocol-wide constants and defaults.

use std::time::Duration;

/// Wire version spoken by this build.
pub const CURRENT_VERSION: u16 = 1;

/// Size of the frame length header, in bytes.
pub const HEADER_SIZE: usize = 4;

/// Fixed envelope overhead: version(2) + checksum(4) + timestamp(8) +
/// sequence(8).
pub const ENVELOPE_OVERHEAD: usize = 22;

/// Largest frame body accepted: 100 MiB. Exceeding it is fatal for the
/// connection.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Default deadline for dials, writes and handshakes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between heartbeats when the feature is negotiated.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive missed heartbeats tolerated before the link is declared dead.
pub const MAX_MISSED_HEARTBEATS: u32 = 3;

/// Default sustained send rate: 50 MiB/s.
pub const RATE_LIMIT: u64 = 50 * 1024 * 1024;

/// Largest single flow-control acquisition: 20 MiB.
pub const RATE_LIMIT_BURST: u64 = 20 * 1024 * 1024;

/// Default sliding-window size for in-flight bytes: 20 MiB.
pub const FLOW_WINDOW: u64 = 20 * 1024 * 1024;

/// Resume threshold once a full window drains: 10 MiB.
pub const FLOW_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Granularity of flow-control acquisitions.
pub const FLOW_CHUNK: usize = 64 * 1024;

/// Size of each pooled scratch buffer: 2 MiB.
pub const BUFFER_POOL_ELEMENT: usize = 2 * 1024 * 1024;

/// Sequence numbers remembered for duplicate detection.
pub const TRACKER_CAPACITY: usize = 10_000;

/// Oldest timestamp accepted on an inbound message.
pub const MAX_MESSAGE_AGE: Duration = Duration::from_secs(60);

/// Default reconnect attempts for recoverable failures.
pub const MAX_RETRIES: u32 = 3;

/// Delay between reconnect attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Bounded send-queue capacity.
pub const QUEUE_CAPACITY: usize = 10_000;

/// Queue length at which producers are asked to back off.
pub const QUEUE_HIGH_WATERMARK: usize = 10_000;

/// Queue length at which producers may resume.
pub const QUEUE_LOW_WATERMARK: usize = 1_000;
