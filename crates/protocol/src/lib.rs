#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `protocol` is the wire layer of DeFS: a length-framed binary transport
//! that carries segment requests and responses between peers. Every frame
//! is an [`Envelope`] with a version, a CRC32-IEEE checksum, a timestamp and
//! a per-connection sequence number; the first frame on any link is a
//! handshake that negotiates optional features (heartbeat, reconnect,
//! compression, encryption).
//!
//! # Design
//!
//! - [`FrameCodec`] handles the outer `u32` length header and envelope
//!   structure; length violations are fatal, integrity violations are not.
//! - [`Connection`] owns one TCP link: producers enqueue payloads into a
//!   bounded [`SendQueue`], a single writer task stamps sequence numbers
//!   and drains it, so frames never interleave, and a reader task filters
//!   inbound frames through checksum, version, age and duplicate checks
//!   before delivery.
//! - [`FlowController`] budgets the writer with a sliding in-flight window
//!   plus a per-second rate bucket, acquired in 64 KiB slices.
//! - Recoverable transport failures trigger reconnection with bounded
//!   retries when the feature was negotiated; panics inside the I/O driver
//!   are captured and surfaced as structured errors.
//!
//! # Invariants
//!
//! - Outbound sequence numbers are monotonic per connection, including
//!   across reconnects.
//! - A frame whose checksum does not match is dropped without disturbing
//!   the stream; repeated violations close the connection.
//! - The receiver never observes a duplicate sequence number within the
//!   tracker window.

mod buffer;
mod codec;
mod connection;
mod envelope;
mod error;
mod flow;
mod handshake;
pub mod limits;
mod payload;
mod queue;
mod tracker;
mod wire;

pub use crate::buffer::BufferPool;
pub use crate::codec::FrameCodec;
pub use crate::connection::{
    Connection, ConnectionConfig, ConnectionState, ConnectionStats, PanicHook,
};
pub use crate::envelope::{Envelope, unix_nanos};
pub use crate::error::{ErrorCode, ProtocolError, ProtocolResult};
pub use crate::flow::{FlowConfig, FlowController, chunks};
pub use crate::handshake::{
    HandshakeRequest, HandshakeResponse, HandshakeStatus, features, negotiate,
};
pub use crate::payload::{
    Payload, PutAck, PutSegment, SegmentErrorCode, SegmentRequest, SegmentResponse,
};
pub use crate::queue::{OverflowPolicy, QueueConfig, SendQueue};
pub use crate::tracker::{SequenceTracker, TrackOutcome};
