use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::limits::{ENVELOPE_OVERHEAD, HEADER_SIZE, MAX_MESSAGE_SIZE};

/// Codec for the outer frame: a `u32` big-endian length header followed by
/// an [`Envelope`] body.
///
/// Length violations are fatal: a peer advertising a frame larger than the
/// configured ceiling (or smaller than the fixed envelope header) is either
/// corrupt or hostile, and the stream position can no longer be trusted.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    /// Codec bounded by `max_frame` body bytes.
    #[must_use]
    pub const fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Configured body ceiling.
    #[must_use]
    pub const fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&src[..HEADER_SIZE]);
        let length = u32::from_be_bytes(header) as usize;

        if length < ENVELOPE_OVERHEAD || length > self.max_frame {
            return Err(ProtocolError::InvalidLength {
                actual: length as u64,
                limit: self.max_frame as u64,
            });
        }

        if src.len() < HEADER_SIZE + length {
            // Reserve what we already know is coming to avoid growth churn.
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(length).freeze();
        Envelope::decode(body).map(Some)
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body_len = item.encoded_len();
        if body_len > self.max_frame {
            return Err(ProtocolError::Size {
                actual: body_len,
                limit: self.max_frame,
            });
        }

        dst.reserve(HEADER_SIZE + body_len);
        dst.put_u32(body_len as u32);
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encode_one(envelope: &Envelope) -> BytesMut {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(envelope.clone(), &mut buf)
            .expect("within limits");
        buf
    }

    #[test]
    fn encode_decode_round_trip() {
        let envelope = Envelope::new(3, Bytes::from_static(b"abc"));
        let mut buf = encode_one(&envelope);

        let mut codec = FrameCodec::default();
        let decoded = codec
            .decode(&mut buf)
            .expect("parses")
            .expect("one full frame");
        assert_eq!(decoded, envelope);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let envelope = Envelope::new(9, Bytes::from_static(b"partial body"));
        let full = encode_one(&envelope);

        let mut codec = FrameCodec::default();
        let mut partial = BytesMut::from(&full[..full.len() - 5]);
        assert!(codec.decode(&mut partial).expect("no error").is_none());

        partial.extend_from_slice(&full[full.len() - 5..]);
        let decoded = codec
            .decode(&mut partial)
            .expect("parses")
            .expect("complete now");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn two_back_to_back_frames_decode_in_order() {
        let first = Envelope::new(1, Bytes::from_static(b"first"));
        let second = Envelope::new(2, Bytes::from_static(b"second"));
        let mut buf = encode_one(&first);
        buf.unsplit(encode_one(&second));

        let mut codec = FrameCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().sequence, 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().sequence, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_length_header_is_fatal() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.put_u32(2048);
        buf.put_slice(&[0u8; 64]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidLength { actual: 2048, .. })
        ));
    }

    #[test]
    fn undersized_length_header_is_fatal() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32((ENVELOPE_OVERHEAD - 1) as u32);
        buf.put_slice(&[0u8; ENVELOPE_OVERHEAD]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn encode_rejects_payload_over_limit() {
        let mut codec = FrameCodec::new(64);
        let envelope = Envelope::new(1, Bytes::from(vec![0u8; 128]));
        let mut buf = BytesMut::new();

        assert!(matches!(
            codec.encode(envelope, &mut buf),
            Err(ProtocolError::Size { .. })
        ));
    }
}
