#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `engine` is the transfer core of DeFS: it turns a file into
//! erasure-coded segments and scatters them over the overlay
//! ([`Uploader`]), and it gathers any sufficient subset back into the
//! original bytes ([`Downloader`]). The server half ([`SegmentService`])
//! answers put and get requests against a pluggable blob store behind an
//! authorization seam.
//!
//! # Design
//!
//! - A file of length `N` splits into `k = ceil(N / segment_size)` padded
//!   shards, extended to `k + m` by Reed-Solomon; any `k` of them recover
//!   the file.
//! - Segment ids are `SHA-256(file_id ‖ index ‖ content)`, so the id in
//!   the slice table doubles as the integrity check on received content.
//! - Placement and recovery target peers by XOR distance between
//!   `SHA-256(segment_id)` and peer positions in the routing table.
//! - Per task, at most `concurrency` segments are in flight; per segment,
//!   up to `replication` candidates are attempted simultaneously (one
//!   outstanding request per peer), with failed attempts replaced by
//!   next-nearest candidates under a bounded retry budget.
//! - Downloads stop scheduling as soon as the recovery threshold is met
//!   and cancel outstanding fetches.

mod auth;
mod config;
mod dial;
mod download;
pub mod erasure;
mod error;
mod service;
pub mod slice;
mod store;
mod upload;

pub use crate::auth::{AclAuthorizer, AllowAll, Authorizer};
pub use crate::config::{DownloadConfig, MAX_SHARDS, ParityPlan, UploadConfig};
pub use crate::dial::{Dialer, TcpDialer};
pub use crate::download::Downloader;
pub use crate::error::{EngineError, EngineResult};
pub use crate::service::SegmentService;
pub use crate::slice::{FileManifest, build_slice_table, reassemble, segment_id, split_padded};
pub use crate::store::{MemorySegmentStore, SegmentStore};
pub use crate::upload::Uploader;
