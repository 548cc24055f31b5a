use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::limits::{CURRENT_VERSION, ENVELOPE_OVERHEAD};

/// One framed wire message, minus the outer length header.
///
/// Layout on the wire, all big-endian:
///
/// ```text
/// +----------+-----------+--------------+--------------+---------+
/// | version2 | checksum4 | timestamp8   | sequence8    | payload |
/// +----------+-----------+--------------+--------------+---------+
/// ```
///
/// The checksum is CRC32-IEEE over everything from the timestamp onward, so
/// the version field can be inspected (and rejected) without touching the
/// checksum, while tampering with timestamp, sequence or payload is caught.
/// An empty payload is a heartbeat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Wire version the sender speaks.
    pub version: u16,
    /// CRC32-IEEE over timestamp, sequence and payload.
    pub checksum: u32,
    /// Send time in unix nanoseconds.
    pub timestamp: i64,
    /// Monotonic per-connection sequence number.
    pub sequence: u64,
    /// Opaque application payload.
    pub payload: Bytes,
}

impl Envelope {
    /// Builds an envelope stamped with the current time and a valid
    /// checksum.
    #[must_use]
    pub fn new(sequence: u64, payload: Bytes) -> Self {
        let timestamp = unix_nanos();
        let checksum = checksum_over(timestamp, sequence, &payload);
        Self {
            version: CURRENT_VERSION,
            checksum,
            timestamp,
            sequence,
            payload,
        }
    }

    /// A heartbeat: an envelope with an empty payload.
    #[must_use]
    pub fn heartbeat(sequence: u64) -> Self {
        Self::new(sequence, Bytes::new())
    }

    /// Whether this envelope is a heartbeat.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.payload.is_empty()
    }

    /// Total encoded length, excluding the outer length header.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_OVERHEAD + self.payload.len()
    }

    /// Recomputes the checksum from the current fields.
    #[must_use]
    pub fn computed_checksum(&self) -> u32 {
        checksum_over(self.timestamp, self.sequence, &self.payload)
    }

    /// Verifies the stored checksum, failing with
    /// [`ProtocolError::Checksum`] on mismatch.
    pub fn verify_checksum(&self) -> ProtocolResult<()> {
        let computed = self.computed_checksum();
        if computed == self.checksum {
            Ok(())
        } else {
            Err(ProtocolError::Checksum {
                expected: self.checksum,
                computed,
            })
        }
    }

    /// Writes the envelope body into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u16(self.version);
        dst.put_u32(self.checksum);
        dst.put_i64(self.timestamp);
        dst.put_u64(self.sequence);
        dst.put_slice(&self.payload);
    }

    /// Parses an envelope body. The caller has already stripped the length
    /// header and bounded `src` to the advertised frame length.
    ///
    /// Only structure is validated here; checksum verification is a
    /// separate, explicit step so that a corrupt message can be dropped
    /// without tearing the connection down.
    pub fn decode(mut src: Bytes) -> ProtocolResult<Self> {
        if src.len() < ENVELOPE_OVERHEAD {
            return Err(ProtocolError::Deserialize(format!(
                "envelope body of {} bytes is shorter than the {ENVELOPE_OVERHEAD}-byte header",
                src.len()
            )));
        }

        let version = src.get_u16();
        let checksum = src.get_u32();
        let timestamp = src.get_i64();
        let sequence = src.get_u64();

        Ok(Self {
            version,
            checksum,
            timestamp,
            sequence,
            payload: src,
        })
    }
}

fn checksum_over(timestamp: i64, sequence: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&timestamp.to_be_bytes());
    hasher.update(&sequence.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Current time as unix nanoseconds.
#[must_use]
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}
