use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::wire::{get_bytes, get_string, put_bytes, put_string};

/// Optional capabilities advertised during the handshake, as a bitmap.
pub mod features {
    /// Payload compression.
    pub const COMPRESSION: u32 = 1 << 0;
    /// Payload encryption.
    pub const ENCRYPTION: u32 = 1 << 1;
    /// Periodic liveness messages.
    pub const HEARTBEAT: u32 = 1 << 2;
    /// Automatic reconnection on recoverable failures.
    pub const RECONNECT: u32 = 1 << 3;
}

/// Intersection of both sides' advertised features.
#[must_use]
pub const fn negotiate(ours: u32, theirs: u32) -> u32 {
    ours & theirs
}

/// Outcome code carried by a [`HandshakeResponse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum HandshakeStatus {
    /// Connection accepted.
    Ok = 0,
    /// Versions are incompatible.
    VersionMismatch = 1,
    /// Refused for any other reason (auth, capacity).
    Rejected = 2,
}

impl HandshakeStatus {
    /// Decodes a wire status; unknown values map to `Rejected`.
    #[must_use]
    pub const fn from_wire(raw: u16) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::VersionMismatch,
            _ => Self::Rejected,
        }
    }
}

/// First message on every new connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Wire version the initiator speaks.
    pub version: u16,
    /// Initiator clock, unix nanoseconds.
    pub timestamp: i64,
    /// Requested feature bitmap.
    pub features: u32,
    /// Opaque authentication data, forwarded to the authorizer.
    pub auth_data: Bytes,
}

impl HandshakeRequest {
    pub(crate) fn encode_into(&self, dst: &mut BytesMut) -> ProtocolResult<()> {
        dst.put_u16(self.version);
        dst.put_i64(self.timestamp);
        dst.put_u32(self.features);
        put_bytes(dst, &self.auth_data)
    }

    pub(crate) fn decode_from(src: &mut Bytes) -> ProtocolResult<Self> {
        if src.remaining() < 2 + 8 + 4 {
            return Err(ProtocolError::Deserialize(
                "handshake request truncated".into(),
            ));
        }
        Ok(Self {
            version: src.get_u16(),
            timestamp: src.get_i64(),
            features: src.get_u32(),
            auth_data: get_bytes(src)?,
        })
    }
}

/// Reply to a [`HandshakeRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Accept / reject outcome.
    pub status: HandshakeStatus,
    /// Wire version the responder speaks.
    pub version: u16,
    /// Features both sides agreed on.
    pub features: u32,
    /// Human-readable detail, mostly for rejections.
    pub message: String,
}

impl HandshakeResponse {
    pub(crate) fn encode_into(&self, dst: &mut BytesMut) -> ProtocolResult<()> {
        dst.put_u16(self.status as u16);
        dst.put_u16(self.version);
        dst.put_u32(self.features);
        put_string(dst, &self.message)
    }

    pub(crate) fn decode_from(src: &mut Bytes) -> ProtocolResult<Self> {
        if src.remaining() < 2 + 2 + 4 {
            return Err(ProtocolError::Deserialize(
                "handshake response truncated".into(),
            ));
        }
        Ok(Self {
            status: HandshakeStatus::from_wire(src.get_u16()),
            version: src.get_u16(),
            features: src.get_u32(),
            message: get_string(src)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_keeps_common_features_only() {
        let ours = features::HEARTBEAT | features::RECONNECT | features::COMPRESSION;
        let theirs = features::HEARTBEAT | features::ENCRYPTION;
        assert_eq!(negotiate(ours, theirs), features::HEARTBEAT);
    }

    #[test]
    fn status_decodes_known_values() {
        assert_eq!(HandshakeStatus::from_wire(0), HandshakeStatus::Ok);
        assert_eq!(
            HandshakeStatus::from_wire(1),
            HandshakeStatus::VersionMismatch
        );
        assert_eq!(HandshakeStatus::from_wire(77), HandshakeStatus::Rejected);
    }

    #[test]
    fn request_round_trip() {
        let request = HandshakeRequest {
            version: 1,
            timestamp: 1_700_000_000_000_000_000,
            features: features::HEARTBEAT,
            auth_data: Bytes::from_static(b"token"),
        };
        let mut buf = BytesMut::new();
        request.encode_into(&mut buf).expect("encodes");

        let mut bytes = buf.freeze();
        let decoded = HandshakeRequest::decode_from(&mut bytes).expect("decodes");
        assert_eq!(decoded, request);
        assert!(bytes.is_empty());
    }

    #[test]
    fn response_round_trip() {
        let response = HandshakeResponse {
            status: HandshakeStatus::VersionMismatch,
            version: 1,
            features: 0,
            message: "version 255 not supported".into(),
        };
        let mut buf = BytesMut::new();
        response.encode_into(&mut buf).expect("encodes");

        let decoded =
            HandshakeResponse::decode_from(&mut buf.freeze()).expect("decodes");
        assert_eq!(decoded, response);
    }

    #[test]
    fn truncated_request_is_rejected() {
        let mut short = Bytes::from_static(&[0u8; 5]);
        assert!(HandshakeRequest::decode_from(&mut short).is_err());
    }
}
