//! Property-based tests for Overturn
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

fn any_payload_type() -> impl Strategy<Value = overturn_core::PayloadType> {
    use overturn_core::PayloadType;
    prop_oneof![
        Just(PayloadType::Raw),
        Just(PayloadType::NodeActivate),
        Just(PayloadType::HeartbeatMaster),
        Just(PayloadType::HeartbeatNode),
        Just(PayloadType::JoinRequest),
    ]
}

// ============================================================================
// Packet Codec Properties
// ============================================================================

mod packet_properties {
    use super::*;
    use overturn_core::{DEFAULT_SIZE_LIMIT, HEADER_SIZE, MAGIC, Packet, PacketError};

    proptest! {
        /// place + pack + unpack returns the original payload and type
        #[test]
        fn packet_roundtrip(
            payload_type in any_payload_type(),
            payload in prop::collection::vec(any::<u8>(), 0..1500),
            slack in 0usize..64,
        ) {
            let mut buf = vec![0u8; HEADER_SIZE + payload.len() + slack];
            let mut packet = Packet::place(&mut buf, payload.len(), payload_type).unwrap();
            packet.payload_mut().copy_from_slice(&payload);
            let bytes = packet.pack();

            prop_assert_eq!(bytes.len(), HEADER_SIZE + payload.len());
            let parsed = Packet::unpack(bytes, DEFAULT_SIZE_LIMIT).unwrap();
            prop_assert_eq!(parsed.payload_type(), payload_type);
            prop_assert_eq!(parsed.payload(), &payload[..]);
        }

        /// Any corrupted magic byte is rejected
        #[test]
        fn corrupted_magic_rejected(
            payload in prop::collection::vec(any::<u8>(), 0..256),
            position in 0usize..4,
            flip in 1u8..=255,
        ) {
            let mut bytes = Packet::encode(overturn_core::PayloadType::Raw, &payload).unwrap();
            bytes[position] ^= flip;
            prop_assert_eq!(
                Packet::unpack(&bytes, DEFAULT_SIZE_LIMIT).unwrap_err(),
                PacketError::InvalidMagic
            );
        }

        /// A length field that disagrees with the buffer is rejected
        #[test]
        fn length_mismatch_rejected(
            payload in prop::collection::vec(any::<u8>(), 1..256),
            extra in prop::collection::vec(any::<u8>(), 1..16),
            truncate in any::<bool>(),
        ) {
            let mut bytes = Packet::encode(overturn_core::PayloadType::Raw, &payload).unwrap();
            if truncate {
                bytes.pop();
            } else {
                bytes.extend_from_slice(&extra);
            }
            let is_size_mismatch = matches!(
                Packet::unpack(&bytes, DEFAULT_SIZE_LIMIT),
                Err(PacketError::SizeMismatch { .. })
            );
            prop_assert!(is_size_mismatch);
        }

        /// Buffers shorter than the header are rejected
        #[test]
        fn short_buffer_rejected(len in 0usize..HEADER_SIZE) {
            let mut bytes = vec![0u8; len];
            let prefix = len.min(MAGIC.len());
            bytes[..prefix].copy_from_slice(&MAGIC[..prefix]);
            prop_assert_eq!(
                Packet::unpack(&bytes, DEFAULT_SIZE_LIMIT).unwrap_err(),
                PacketError::TooShort { expected: HEADER_SIZE, actual: len }
            );
        }

        /// A valid frame above the caller's limit is rejected
        #[test]
        fn oversize_rejected(payload_len in 1usize..2048, below in 1usize..=HEADER_SIZE) {
            let bytes = Packet::encode(overturn_core::PayloadType::Raw, &vec![0u8; payload_len]).unwrap();
            let limit = bytes.len() - below;
            prop_assert_eq!(
                Packet::unpack(&bytes, limit).unwrap_err(),
                PacketError::OversizeLimit { encoded: bytes.len(), limit }
            );
            prop_assert!(Packet::unpack(&bytes, bytes.len()).is_ok());
        }

        /// Type codes above the defined range are rejected
        #[test]
        fn unknown_type_rejected(code in 5u16..) {
            let mut bytes = Packet::encode(overturn_core::PayloadType::Raw, b"x").unwrap();
            bytes[6..8].copy_from_slice(&code.to_be_bytes());
            prop_assert_eq!(
                Packet::unpack(&bytes, DEFAULT_SIZE_LIMIT).unwrap_err(),
                PacketError::UnknownType(code)
            );
        }
    }
}

// ============================================================================
// Control Message Properties
// ============================================================================

mod message_properties {
    use super::*;
    use overturn_core::{
        ControlMessage, DEFAULT_SIZE_LIMIT, Heartbeat, HeartbeatKind, JoinRequest, Message,
        MessageError, NetName, NodeActivate, Packet, PayloadType,
    };
    use uuid::Uuid;

    fn net_name() -> impl Strategy<Value = NetName> {
        "[a-z0-9_]{1,16}".prop_map(|name| NetName::new(&name))
    }

    fn uuid() -> impl Strategy<Value = Uuid> {
        any::<u128>().prop_map(Uuid::from_u128)
    }

    proptest! {
        /// Heartbeats survive packet encoding field for field
        #[test]
        fn heartbeat_roundtrip(
            master_kind in any::<bool>(),
            net_name in net_name(),
            master in uuid(),
            term in any::<u64>(),
            index in any::<u64>(),
        ) {
            let kind = if master_kind { HeartbeatKind::Master } else { HeartbeatKind::Node };
            let heartbeat = Heartbeat::new(kind, net_name, master, term, index);
            prop_assert_eq!(heartbeat.marshal().len(), Heartbeat::SIZE);

            let bytes = heartbeat.to_packet().unwrap();
            let packet = Packet::unpack(&bytes, DEFAULT_SIZE_LIMIT).unwrap();
            prop_assert_eq!(
                ControlMessage::from_packet(&packet).unwrap(),
                ControlMessage::Heartbeat(heartbeat)
            );
        }

        /// Join requests survive packet encoding
        #[test]
        fn join_request_roundtrip(name in net_name(), token in uuid()) {
            let request = JoinRequest::new(name, token);
            let bytes = request.to_packet().unwrap();
            let packet = Packet::unpack(&bytes, DEFAULT_SIZE_LIMIT).unwrap();
            prop_assert_eq!(
                ControlMessage::from_packet(&packet).unwrap(),
                ControlMessage::JoinRequest(request)
            );
        }

        /// Activations survive packet encoding
        #[test]
        fn node_activate_roundtrip(id in uuid()) {
            let activate = NodeActivate::new(id);
            prop_assert_eq!(activate.marshal(), id.as_bytes().to_vec());
            prop_assert_eq!(
                NodeActivate::unmarshal(PayloadType::NodeActivate, &activate.marshal()).unwrap(),
                activate
            );
        }

        /// Any length other than the fixed size is a format error
        #[test]
        fn wrong_size_rejected(len in 0usize..128) {
            prop_assume!(len != Heartbeat::SIZE);
            let buf = vec![0u8; len];
            let is_invalid = matches!(
                Heartbeat::unmarshal(PayloadType::HeartbeatMaster, &buf),
                Err(MessageError::InvalidHeartbeat { .. })
            );
            prop_assert!(is_invalid);
            if len != JoinRequest::SIZE {
                prop_assert!(JoinRequest::unmarshal(PayloadType::JoinRequest, &buf).is_err());
            }
            if len != NodeActivate::SIZE {
                prop_assert!(NodeActivate::unmarshal(PayloadType::NodeActivate, &buf).is_err());
            }
        }

        /// Names longer than the field are truncated, shorter ones padded
        #[test]
        fn net_name_fixed_width(name in "[a-z]{0,40}") {
            let net_name = NetName::new(&name);
            let expected = &name[..name.len().min(16)];
            prop_assert_eq!(net_name.to_string_lossy(), expected);
        }
    }
}

// ============================================================================
// ICMP Framing Properties
// ============================================================================

mod icmp_properties {
    use super::*;
    use overturn_transport::icmp::{
        ICMP_HEADER_SIZE, IcmpType, encapsulate, parse_echo, verify_checksum,
    };

    proptest! {
        /// Every encapsulated message carries a valid checksum
        #[test]
        fn checksum_valid(
            echo in any::<bool>(),
            identifier in any::<u16>(),
            sequence in any::<u16>(),
            payload in prop::collection::vec(any::<u8>(), 0..1500),
        ) {
            let icmp_type = if echo { IcmpType::Echo } else { IcmpType::EchoReply };
            let message = encapsulate(icmp_type, identifier, sequence, &payload);
            prop_assert_eq!(message.len(), ICMP_HEADER_SIZE + payload.len());
            prop_assert!(verify_checksum(&message));

            let (header, data) = parse_echo(&message).unwrap();
            prop_assert_eq!(header.icmp_type, icmp_type);
            prop_assert_eq!(header.identifier, identifier);
            prop_assert_eq!(header.sequence, sequence);
            prop_assert_eq!(data, &payload[..]);
        }

        /// A single flipped bit breaks the checksum
        #[test]
        fn checksum_detects_bit_flip(
            payload in prop::collection::vec(any::<u8>(), 1..256),
            position in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut message = encapsulate(IcmpType::EchoReply, 1, 1, &payload);
            let at = position.index(message.len());
            message[at] ^= 1 << bit;
            prop_assert!(!verify_checksum(&message));
        }
    }
}
