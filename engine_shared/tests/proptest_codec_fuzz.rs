//! Fuzz-style property tests for the wire codecs.
//!
//! Decoders face untrusted network input: arbitrary bytes must produce an
//! error, never a panic.

use engine_shared::{
    binary_data::{register_engine_types, BinaryDataSetBuilder, DescriptorId, FieldValue},
    net::{ClientMessage, ClientMessageType, ServerMessage, ServerMessageType},
    snapshot::SnapshotDelta,
    wire::{Frames, PacketHeader},
};
use proptest::prelude::*;

proptest! {
    /// Property: arbitrary datagrams don't crash header/frame parsing
    #[test]
    fn arbitrary_datagrams_dont_crash_framing(
        random_bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        if let Ok((_, body)) = PacketHeader::read(&random_bytes) {
            for _frame in Frames::new(body) {}
        }
    }

    /// Property: arbitrary payloads don't crash any client message decoder
    #[test]
    fn arbitrary_bytes_dont_crash_client_decoders(
        random_bytes in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        for ty in ClientMessageType::ALL {
            let _ = ClientMessage::decode(ty, &random_bytes);
        }
    }

    /// Property: arbitrary payloads don't crash any server message decoder
    #[test]
    fn arbitrary_bytes_dont_crash_server_decoders(
        random_bytes in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        for ty in ServerMessageType::ALL {
            let _ = ServerMessage::decode(ty, &random_bytes);
        }
    }

    /// Property: arbitrary bytes don't crash the snapshot decoder
    #[test]
    fn arbitrary_bytes_dont_crash_snapshot_decoder(
        random_bytes in prop::collection::vec(any::<u8>(), 0..1024),
    ) {
        let mut b = BinaryDataSetBuilder::new();
        register_engine_types(&mut b).unwrap();
        let set = b.build();
        let _ = SnapshotDelta::decode(&random_bytes, &set);
    }

    /// Property: a value encoded with a descriptor decodes identically on a
    /// peer holding an identical set
    #[test]
    fn entity_state_roundtrips_across_identical_sets(
        origin in prop::array::uniform3(-1.0e6f32..1.0e6),
        model_index in any::<u32>(),
        health in any::<i32>(),
        visible in any::<bool>(),
    ) {
        let build = || {
            let mut b = BinaryDataSetBuilder::new();
            register_engine_types(&mut b).unwrap();
            b.build()
        };
        let (server, client) = (build(), build());
        prop_assert_eq!(server.compare(client.descriptors()), Ok(()));

        let values = vec![
            FieldValue::Vec3(origin),
            FieldValue::Vec3([0.0, 0.0, 0.0]),
            FieldValue::UInt32(model_index),
            FieldValue::Int32(health),
            FieldValue::UInt32(0),
            FieldValue::Bool(visible),
        ];
        let mut buf = bytes::BytesMut::new();
        server.encode(DescriptorId(0), &values, &mut buf).unwrap();

        let mut rd = &buf[..];
        prop_assert_eq!(client.decode(DescriptorId(0), &mut rd).unwrap(), values);
        prop_assert!(rd.is_empty());
    }
}
