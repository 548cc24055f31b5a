use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::handshake::{HandshakeRequest, HandshakeResponse};
use crate::wire::{get_bytes, get_string, put_bytes, put_string};

const TAG_HANDSHAKE_REQUEST: u8 = 1;
const TAG_HANDSHAKE_RESPONSE: u8 = 2;
const TAG_SEGMENT_REQUEST: u8 = 3;
const TAG_SEGMENT_RESPONSE: u8 = 4;
const TAG_PUT_SEGMENT: u8 = 5;
const TAG_PUT_ACK: u8 = 6;

/// Application-level failure codes carried in segment responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SegmentErrorCode {
    /// Catch-all.
    Unspecified = 0,
    /// Transient network failure on the serving side.
    Network = 1,
    /// Request could not be parsed or is inconsistent.
    InvalidRequest = 2,
    /// The file id is unknown.
    InvalidFileId = 3,
    /// The segment id is malformed.
    InvalidSegmentId = 4,
    /// The task id is unknown to the server.
    InvalidTaskId = 5,
    /// The server does not hold the segment.
    SegmentNotFound = 6,
    /// The requester is not authorized for the file.
    FilePermission = 7,
    /// Stored content no longer matches its digest.
    SegmentCorrupted = 8,
    /// Internal server failure.
    System = 9,
}

impl SegmentErrorCode {
    /// Decodes a wire value; unknown codes collapse to `Unspecified`.
    #[must_use]
    pub const fn from_wire(raw: u16) -> Self {
        match raw {
            1 => Self::Network,
            2 => Self::InvalidRequest,
            3 => Self::InvalidFileId,
            4 => Self::InvalidSegmentId,
            5 => Self::InvalidTaskId,
            6 => Self::SegmentNotFound,
            7 => Self::FilePermission,
            8 => Self::SegmentCorrupted,
            9 => Self::System,
            _ => Self::Unspecified,
        }
    }

    /// Whether retrying the same request against another peer can help.
    #[must_use]
    pub const fn is_retryable_elsewhere(self) -> bool {
        !matches!(self, Self::InvalidRequest | Self::InvalidTaskId)
    }
}

/// Request for one stored segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRequest {
    /// Requesting task, for server-side bookkeeping.
    pub task_id: String,
    /// File the segment belongs to.
    pub file_id: String,
    /// Digest identifying the segment.
    pub segment_id: String,
    /// Hash of the requester's public key, checked against the file ACL.
    pub pubkey_hash: Bytes,
}

/// Answer to a [`SegmentRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SegmentResponse {
    /// Segment served.
    Ok {
        /// Digest identifying the segment.
        segment_id: String,
        /// Raw segment bytes.
        content: Bytes,
        /// Opaque side-band metadata.
        metadata: Bytes,
    },
    /// Segment not served.
    Err {
        /// Failure class.
        code: SegmentErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

/// Request to store one segment on the receiving peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutSegment {
    /// Uploading task.
    pub task_id: String,
    /// File the segment belongs to.
    pub file_id: String,
    /// Digest identifying the segment.
    pub segment_id: String,
    /// Raw segment bytes.
    pub content: Bytes,
    /// Opaque side-band metadata stored with the segment.
    pub metadata: Bytes,
}

/// Acknowledgement for a [`PutSegment`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutAck {
    /// Segment stored.
    Ok {
        /// Digest of the stored segment.
        segment_id: String,
    },
    /// Segment refused.
    Err {
        /// Digest of the refused segment.
        segment_id: String,
        /// Failure class.
        code: SegmentErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

/// Every application message that can ride in an envelope payload.
///
/// A heartbeat is not a variant here: it is the *absence* of a payload at
/// the envelope layer and never reaches payload decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Connection opening.
    HandshakeRequest(HandshakeRequest),
    /// Connection opening reply.
    HandshakeResponse(HandshakeResponse),
    /// Fetch a segment.
    SegmentRequest(SegmentRequest),
    /// Segment fetch result.
    SegmentResponse(SegmentResponse),
    /// Store a segment.
    PutSegment(PutSegment),
    /// Segment store result.
    PutAck(PutAck),
}

impl Payload {
    /// Serializes the payload for the envelope.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        let mut dst = BytesMut::new();
        match self {
            Self::HandshakeRequest(request) => {
                dst.put_u8(TAG_HANDSHAKE_REQUEST);
                request.encode_into(&mut dst)?;
            }
            Self::HandshakeResponse(response) => {
                dst.put_u8(TAG_HANDSHAKE_RESPONSE);
                response.encode_into(&mut dst)?;
            }
            Self::SegmentRequest(request) => {
                dst.put_u8(TAG_SEGMENT_REQUEST);
                put_string(&mut dst, &request.task_id)?;
                put_string(&mut dst, &request.file_id)?;
                put_string(&mut dst, &request.segment_id)?;
                put_bytes(&mut dst, &request.pubkey_hash)?;
            }
            Self::SegmentResponse(response) => {
                dst.put_u8(TAG_SEGMENT_RESPONSE);
                match response {
                    SegmentResponse::Ok {
                        segment_id,
                        content,
                        metadata,
                    } => {
                        dst.put_u8(0);
                        put_string(&mut dst, segment_id)?;
                        put_bytes(&mut dst, content)?;
                        put_bytes(&mut dst, metadata)?;
                    }
                    SegmentResponse::Err { code, message } => {
                        dst.put_u8(1);
                        dst.put_u16(*code as u16);
                        put_string(&mut dst, message)?;
                    }
                }
            }
            Self::PutSegment(put) => {
                dst.put_u8(TAG_PUT_SEGMENT);
                put_string(&mut dst, &put.task_id)?;
                put_string(&mut dst, &put.file_id)?;
                put_string(&mut dst, &put.segment_id)?;
                put_bytes(&mut dst, &put.content)?;
                put_bytes(&mut dst, &put.metadata)?;
            }
            Self::PutAck(ack) => {
                dst.put_u8(TAG_PUT_ACK);
                match ack {
                    PutAck::Ok { segment_id } => {
                        dst.put_u8(0);
                        put_string(&mut dst, segment_id)?;
                    }
                    PutAck::Err {
                        segment_id,
                        code,
                        message,
                    } => {
                        dst.put_u8(1);
                        put_string(&mut dst, segment_id)?;
                        dst.put_u16(*code as u16);
                        put_string(&mut dst, message)?;
                    }
                }
            }
        }
        Ok(dst.freeze())
    }

    /// Parses an envelope payload. Empty input is the caller's heartbeat
    /// case and never reaches this function.
    pub fn decode(mut src: Bytes) -> ProtocolResult<Self> {
        if src.is_empty() {
            return Err(ProtocolError::Deserialize(
                "empty payload is a heartbeat, not an application message".into(),
            ));
        }
        let tag = src.get_u8();
        let payload = match tag {
            TAG_HANDSHAKE_REQUEST => {
                Self::HandshakeRequest(HandshakeRequest::decode_from(&mut src)?)
            }
            TAG_HANDSHAKE_RESPONSE => {
                Self::HandshakeResponse(HandshakeResponse::decode_from(&mut src)?)
            }
            TAG_SEGMENT_REQUEST => Self::SegmentRequest(SegmentRequest {
                task_id: get_string(&mut src)?,
                file_id: get_string(&mut src)?,
                segment_id: get_string(&mut src)?,
                pubkey_hash: get_bytes(&mut src)?,
            }),
            TAG_SEGMENT_RESPONSE => {
                if src.remaining() < 1 {
                    return Err(ProtocolError::Deserialize(
                        "segment response truncated".into(),
                    ));
                }
                if src.get_u8() == 0 {
                    Self::SegmentResponse(SegmentResponse::Ok {
                        segment_id: get_string(&mut src)?,
                        content: get_bytes(&mut src)?,
                        metadata: get_bytes(&mut src)?,
                    })
                } else {
                    if src.remaining() < 2 {
                        return Err(ProtocolError::Deserialize(
                            "segment error truncated".into(),
                        ));
                    }
                    Self::SegmentResponse(SegmentResponse::Err {
                        code: SegmentErrorCode::from_wire(src.get_u16()),
                        message: get_string(&mut src)?,
                    })
                }
            }
            TAG_PUT_SEGMENT => Self::PutSegment(PutSegment {
                task_id: get_string(&mut src)?,
                file_id: get_string(&mut src)?,
                segment_id: get_string(&mut src)?,
                content: get_bytes(&mut src)?,
                metadata: get_bytes(&mut src)?,
            }),
            TAG_PUT_ACK => {
                if src.remaining() < 1 {
                    return Err(ProtocolError::Deserialize("put ack truncated".into()));
                }
                if src.get_u8() == 0 {
                    Self::PutAck(PutAck::Ok {
                        segment_id: get_string(&mut src)?,
                    })
                } else {
                    let segment_id = get_string(&mut src)?;
                    if src.remaining() < 2 {
                        return Err(ProtocolError::Deserialize("put ack truncated".into()));
                    }
                    Self::PutAck(PutAck::Err {
                        segment_id,
                        code: SegmentErrorCode::from_wire(src.get_u16()),
                        message: get_string(&mut src)?,
                    })
                }
            }
            unknown => {
                return Err(ProtocolError::Deserialize(format!(
                    "unknown payload tag {unknown}"
                )));
            }
        };
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{HandshakeStatus, features};

    fn round_trip(payload: &Payload) -> Payload {
        let encoded = payload.encode().expect("encodes");
        Payload::decode(encoded).expect("decodes")
    }

    #[test]
    fn handshake_request_round_trip() {
        let payload = Payload::HandshakeRequest(HandshakeRequest {
            version: 1,
            timestamp: 123_456_789,
            features: features::HEARTBEAT | features::RECONNECT,
            auth_data: Bytes::from_static(b"auth"),
        });
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn handshake_response_round_trip() {
        let payload = Payload::HandshakeResponse(HandshakeResponse {
            status: HandshakeStatus::Ok,
            version: 1,
            features: features::HEARTBEAT,
            message: String::new(),
        });
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn segment_request_round_trip() {
        let payload = Payload::SegmentRequest(SegmentRequest {
            task_id: "task-1".into(),
            file_id: "file-9".into(),
            segment_id: "f00dbabe".into(),
            pubkey_hash: Bytes::from_static(&[7u8; 32]),
        });
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn segment_response_ok_round_trip() {
        let payload = Payload::SegmentResponse(SegmentResponse::Ok {
            segment_id: "f00dbabe".into(),
            content: Bytes::from_static(b"the bytes"),
            metadata: Bytes::new(),
        });
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn segment_response_err_round_trip() {
        let payload = Payload::SegmentResponse(SegmentResponse::Err {
            code: SegmentErrorCode::SegmentNotFound,
            message: "no such segment".into(),
        });
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn put_segment_and_ack_round_trip() {
        let put = Payload::PutSegment(PutSegment {
            task_id: "task-1".into(),
            file_id: "file-9".into(),
            segment_id: "cafe".into(),
            content: Bytes::from_static(&[0u8; 128]),
            metadata: Bytes::from_static(b"m"),
        });
        assert_eq!(round_trip(&put), put);

        let ack = Payload::PutAck(PutAck::Err {
            segment_id: "cafe".into(),
            code: SegmentErrorCode::FilePermission,
            message: "not on the acl".into(),
        });
        assert_eq!(round_trip(&ack), ack);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = Payload::decode(Bytes::from_static(&[200, 0, 0])).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialize(_)));
    }

    #[test]
    fn empty_payload_is_not_an_application_message() {
        assert!(Payload::decode(Bytes::new()).is_err());
    }

    #[test]
    fn error_code_wire_values_are_stable() {
        assert_eq!(SegmentErrorCode::Unspecified as u16, 0);
        assert_eq!(SegmentErrorCode::SegmentNotFound as u16, 6);
        assert_eq!(SegmentErrorCode::System as u16, 9);
        assert_eq!(
            SegmentErrorCode::from_wire(8),
            SegmentErrorCode::SegmentCorrupted
        );
        assert_eq!(
            SegmentErrorCode::from_wire(999),
            SegmentErrorCode::Unspecified
        );
    }

    #[test]
    fn permission_errors_are_retryable_elsewhere() {
        // Another holder may still serve us; a malformed request will fail
        // everywhere.
        assert!(SegmentErrorCode::FilePermission.is_retryable_elsewhere());
        assert!(SegmentErrorCode::SegmentNotFound.is_retryable_elsewhere());
        assert!(!SegmentErrorCode::InvalidRequest.is_retryable_elsewhere());
    }
}
