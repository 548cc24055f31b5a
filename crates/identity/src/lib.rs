#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `identity` holds the identifier primitives shared by every DeFS crate:
//! the opaque 32-byte [`NodeId`] a peer is known by, the SHA-256 derived
//! [`DhtId`] the routing table orders peers with, the [`Mode`] tag that
//! records whether a peer stores segments or merely consumes them, and the
//! Base58Check codec used wherever identifiers cross a human-facing
//! boundary.
//!
//! # Design
//!
//! The keyspace module implements XOR metric ordering and common-prefix
//! length over 256-bit ids. Ids are plain byte arrays; all arithmetic is
//! big-endian and allocation-free. Random-target generation
//! ([`DhtId::random_at_cpl`]) produces ids at an exact common-prefix length
//! from a local id, which the table's refresh loop uses to aim lookups at
//! under-populated buckets.
//!
//! # Invariants
//!
//! - `cpl(a, b) == 256` if and only if `a == b`.
//! - `DhtId::random_at_cpl(local, c)` returns an id `t` with
//!   `cpl(local, t) == c` for every `c < 256`.
//! - Base58Check decoding rejects any payload whose 4-byte checksum does not
//!   match the double-SHA-256 of the version-prefixed body.

mod base58;
mod keyspace;
mod node;

pub use crate::base58::{Base58Error, decode_check, encode_check};
pub use crate::keyspace::{Distance, KEY_LEN, cpl};
pub use crate::node::{DhtId, Mode, NodeId};
