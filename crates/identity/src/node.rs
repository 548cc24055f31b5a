use std::fmt;

use sha2::{Digest, Sha256};

use crate::keyspace::{Distance, KEY_LEN, cpl};

/// Stable identifier of a peer: an opaque 32-byte hash of its public key.
///
/// The id itself carries no structure; routing never orders peers by
/// `NodeId` directly but by the derived [`DhtId`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; KEY_LEN]);

impl NodeId {
    /// Wraps raw identifier bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Derives the identifier for a public key.
    #[must_use]
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(Sha256::digest(public_key).into())
    }

    /// Returns the raw identifier bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Derives the keyspace position of this peer.
    #[must_use]
    pub fn dht_id(&self) -> DhtId {
        DhtId(Sha256::digest(self.0).into())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; KEY_LEN]> for NodeId {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

/// Position of a peer in the 256-bit XOR keyspace: SHA-256 of its [`NodeId`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DhtId(pub(crate) [u8; KEY_LEN]);

impl DhtId {
    /// Wraps raw keyspace bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Hashes arbitrary bytes onto the keyspace.
    ///
    /// Segment placement uses this to turn a segment id into a lookup
    /// target.
    #[must_use]
    pub fn hash(input: &[u8]) -> Self {
        Self(Sha256::digest(input).into())
    }

    /// Returns the raw keyspace bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// XOR distance between two keyspace positions.
    #[must_use]
    pub fn distance(&self, other: &Self) -> Distance {
        let mut out = [0u8; KEY_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Common-prefix length in bits with another keyspace position.
    #[must_use]
    pub fn common_prefix_len(&self, other: &Self) -> usize {
        cpl(&self.0, &other.0)
    }

    /// Generates a uniformly random keyspace position.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self(bytes)
    }

    /// Generates a random id whose common-prefix length with `local` is
    /// exactly `target_cpl`.
    ///
    /// The first `target_cpl` bits are copied from `local`, the following
    /// bit is flipped, and the remainder is random. `target_cpl` must be
    /// below 256.
    #[must_use]
    pub fn random_at_cpl(local: &Self, target_cpl: usize) -> Self {
        assert!(target_cpl < KEY_LEN * 8, "cannot share every bit");

        let mut bytes = [0u8; KEY_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);

        let split_byte = target_cpl / 8;
        let split_bit = target_cpl % 8;

        // Whole shared-prefix bytes come straight from local.
        bytes[..split_byte].copy_from_slice(&local.0[..split_byte]);

        // Within the split byte: keep local's high `split_bit` bits, force
        // the next bit to differ, leave the remainder random.
        let prefix_mask = if split_bit == 0 {
            0
        } else {
            0xFFu8 << (8 - split_bit)
        };
        let flip = 0x80u8 >> split_bit;
        bytes[split_byte] = (local.0[split_byte] & prefix_mask) | (bytes[split_byte] & !prefix_mask);
        bytes[split_byte] = (bytes[split_byte] & !flip) | ((local.0[split_byte] ^ flip) & flip);

        Self(bytes)
    }
}

impl fmt::Debug for DhtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtId({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for DhtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Operating mode a peer advertised when it was observed.
///
/// Storage placement only targets peers that answer the server filter;
/// `Auto` peers satisfy every filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mode {
    /// Mode not yet known, or the peer runs both roles.
    #[default]
    Auto = 0,
    /// Consumes segments but does not store them.
    Client = 1,
    /// Stores segments for other peers.
    Server = 2,
}

impl Mode {
    /// Reports whether a peer in this mode satisfies `filter`.
    #[must_use]
    pub const fn matches(self, filter: Self) -> bool {
        matches!(
            (self, filter),
            (Self::Auto, _)
                | (_, Self::Auto)
                | (Self::Client, Self::Client)
                | (Self::Server, Self::Server)
        )
    }

    /// Decodes a wire tag into a mode.
    #[must_use]
    pub const fn from_wire(tag: u8) -> Self {
        match tag {
            1 => Self::Client,
            2 => Self::Server,
            _ => Self::Auto,
        }
    }
}
