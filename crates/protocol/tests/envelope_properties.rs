//! Property tests for envelope framing and integrity.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use protocol::limits::ENVELOPE_OVERHEAD;
use protocol::{Envelope, ProtocolError};

proptest! {
    #[test]
    fn round_trip_any_payload(payload in proptest::collection::vec(any::<u8>(), 0..4096),
                              sequence in any::<u64>()) {
        let envelope = Envelope::new(sequence, Bytes::from(payload));
        let mut buf = BytesMut::new();
        envelope.encode(&mut buf);

        let decoded = Envelope::decode(buf.freeze()).expect("well formed");
        prop_assert_eq!(&decoded, &envelope);
        prop_assert!(decoded.verify_checksum().is_ok());
    }

    #[test]
    fn any_single_byte_flip_in_checksummed_region_is_caught(
        payload in proptest::collection::vec(any::<u8>(), 1..512),
        sequence in any::<u64>(),
        flip_bit in 0u8..8,
        offset_seed in any::<usize>(),
    ) {
        let envelope = Envelope::new(sequence, Bytes::from(payload));
        let mut buf = BytesMut::new();
        envelope.encode(&mut buf);

        // Anywhere from the timestamp (offset 6) to the end is covered by
        // the CRC.
        let span = buf.len() - 6;
        let offset = 6 + offset_seed % span;
        buf[offset] ^= 1 << flip_bit;

        let decoded = Envelope::decode(buf.freeze()).expect("still parses");
        prop_assert!(matches!(
            decoded.verify_checksum(),
            Err(ProtocolError::Checksum { .. })
        ));
    }

    #[test]
    fn version_flips_never_touch_the_checksum(
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        version_byte in 0usize..2,
        flip_bit in 0u8..8,
    ) {
        let envelope = Envelope::new(1, Bytes::from(payload));
        let mut buf = BytesMut::new();
        envelope.encode(&mut buf);

        buf[version_byte] ^= 1 << flip_bit;
        let decoded = Envelope::decode(buf.freeze()).expect("still parses");
        prop_assert!(decoded.verify_checksum().is_ok());
    }

    #[test]
    fn encoded_len_matches_reality(payload_len in 0usize..2048) {
        let envelope = Envelope::new(0, Bytes::from(vec![0u8; payload_len]));
        let mut buf = BytesMut::new();
        envelope.encode(&mut buf);
        prop_assert_eq!(buf.len(), envelope.encoded_len());
        prop_assert_eq!(buf.len(), ENVELOPE_OVERHEAD + payload_len);
    }
}
