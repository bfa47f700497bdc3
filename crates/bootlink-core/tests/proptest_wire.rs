//! Property-based tests for the wire codecs and the untrusted-input parsers.

use std::io::Cursor;

use bootlink_core::codec::{FrameCodec, ProtocolVariant};
use bootlink_core::partition::{GptEntry, build_gpt, parse_gpt};
use bootlink_core::protocol::constants::HDLC_FLAG;
use bootlink_core::sparse::SparseReader;
use proptest::prelude::*;

fn variant() -> impl Strategy<Value = ProtocolVariant> {
    prop_oneof![
        Just(ProtocolVariant::BinaryFramed),
        Just(ProtocolVariant::XmlCommand),
        Just(ProtocolVariant::HdlcFramed),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Decoding an encoded frame yields the same command and payload.
    #[test]
    fn prop_codec_preserves_frame(
        variant in variant(),
        command in 0u32..=0xFFFF,
        payload in proptest::collection::vec(any::<u8>(), 0..2048),
    ) {
        let codec = FrameCodec::for_variant(variant);
        let encoded = codec.encode(command, &payload).map_err(|e| {
            TestCaseError::fail(format!("encode failed: {e}"))
        })?;
        let frame = codec.decode(&encoded).map_err(|e| {
            TestCaseError::fail(format!("decode failed: {e}"))
        })?;
        prop_assert_eq!(frame.command, command);
        prop_assert_eq!(frame.payload, payload);
    }

    /// Two frames back to back split at exactly the first frame's length.
    #[test]
    fn prop_frame_len_finds_boundary(
        variant in variant(),
        first in proptest::collection::vec(any::<u8>(), 0..512),
        second in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let codec = FrameCodec::for_variant(variant);
        let a = codec.encode(0x30, &first).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let b = codec.encode(0x31, &second).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let mut stream = a.clone();
        stream.extend_from_slice(&b);
        let len = codec.frame_len(&stream).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(len, Some(a.len()));
    }

    /// Stuffing leaves flag bytes only at the frame boundaries.
    #[test]
    fn prop_hdlc_flags_only_at_edges(
        payload in proptest::collection::vec(prop_oneof![Just(0x7Eu8), Just(0x7Du8), any::<u8>()], 0..1024),
    ) {
        let codec = FrameCodec::for_variant(ProtocolVariant::HdlcFramed);
        let encoded = codec.encode(0x11, &payload).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(encoded[0], HDLC_FLAG);
        prop_assert_eq!(encoded[encoded.len() - 1], HDLC_FLAG);
        prop_assert!(!encoded[1..encoded.len() - 1].contains(&HDLC_FLAG));
    }

    /// With the CRC trailer on, any single flipped payload byte is caught.
    #[test]
    fn prop_binary_checksum_catches_flips(
        payload in proptest::collection::vec(any::<u8>(), 1..512),
        index in any::<prop::sample::Index>(),
        mask in 1u8..=0xFF,
    ) {
        let mut codec = FrameCodec::for_variant(ProtocolVariant::BinaryFramed);
        codec.set_checksum(true);
        let mut encoded = codec.encode(0x31, &payload).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let at = 12 + index.index(payload.len());
        encoded[at] ^= mask;
        prop_assert!(codec.decode(&encoded).is_err());
    }

    /// A table whose header declares any entry count parses or fails
    /// cleanly, and never accepts a count past the buffer.
    #[test]
    fn prop_gpt_entry_count_is_bounded(count in any::<u32>(), entry_size in any::<u32>()) {
        let entries = [GptEntry { name: "boot".into(), first_lba: 34, last_lba: 99 }];
        let mut table = build_gpt(&entries, 512, 4096);
        let header = 512;
        table[header + 80..header + 84].copy_from_slice(&count.to_le_bytes());
        table[header + 84..header + 88].copy_from_slice(&entry_size.to_le_bytes());
        table[header + 16..header + 20].fill(0);
        let crc = crc32fast::hash(&table[header..header + 92]);
        table[header + 16..header + 20].copy_from_slice(&crc.to_le_bytes());

        if let Ok(partitions) = parse_gpt(&table, 512, 0) {
            let declared = count as u64 * entry_size as u64;
            prop_assert!(declared <= table.len() as u64);
            prop_assert!(partitions.len() <= count as usize);
        }
    }

    /// Arbitrary chunk data after a valid sparse header never panics and
    /// never yields a segment larger than the block bound.
    #[test]
    fn prop_sparse_reader_tolerates_garbage(
        body in proptest::collection::vec(any::<u8>(), 0..256),
        total_blocks in 0u32..1_000_000,
        total_chunks in 0u32..64,
    ) {
        let mut image = Vec::new();
        image.extend_from_slice(&0xED26_FF3Au32.to_le_bytes());
        image.extend_from_slice(&1u16.to_le_bytes());
        image.extend_from_slice(&0u16.to_le_bytes());
        image.extend_from_slice(&28u16.to_le_bytes());
        image.extend_from_slice(&12u16.to_le_bytes());
        image.extend_from_slice(&4096u32.to_le_bytes());
        image.extend_from_slice(&total_blocks.to_le_bytes());
        image.extend_from_slice(&total_chunks.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&body);

        if let Ok(mut reader) = SparseReader::new(Cursor::new(image), 64 * 1024) {
            for _ in 0..128 {
                match reader.next_segment() {
                    Ok(Some(segment)) => {
                        if let bootlink_core::sparse::Segment::Data { bytes, .. } = &segment {
                            prop_assert!(bytes.len() <= 64 * 1024);
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }
}
