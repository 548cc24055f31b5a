#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `routing` implements the k-bucket peer table of the DeFS overlay.
//! Peers are ordered by the XOR metric over their SHA-256 derived
//! [`identity::DhtId`]s and grouped into buckets by common-prefix length
//! with the local node. The table answers one question for the transfer
//! engine: *which peers should carry or serve this segment?*
//!
//! # Design
//!
//! - The bucket vector starts at length one and grows only by splitting the
//!   last bucket, so early tables stay compact.
//! - Every mutation happens under one write lock and either completes or
//!   leaves the table untouched.
//! - A per-CPL diversity filter caps how many peers from one IP group may
//!   occupy the same depth, which blunts Sybil concentration from a single
//!   network.
//! - Eviction is opt-in: only entries admitted as replaceable may be pushed
//!   out of a full bucket.
//!
//! # Invariants
//!
//! - A peer lives in bucket `min(cpl(peer, local), buckets.len() - 1)`.
//! - Only the last bucket splits; trailing empty buckets collapse on
//!   removal, so every non-last bucket is non-empty.
//! - Per CPL, peers from one IP group never exceed the configured cap.

mod bucket;
mod diversity;
mod error;
mod peer;
mod table;

pub use crate::bucket::DEFAULT_BUCKET_SIZE;
pub use crate::diversity::IpGroup;
pub use crate::error::{TableError, TableResult};
pub use crate::peer::PeerInfo;
pub use crate::table::{MAX_BUCKETS, MAX_CPL_FOR_REFRESH, RoutingTable, TableConfig};
