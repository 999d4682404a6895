//! Integration tests for lowcar message framing
//!
//! Covers every message kind through the full frame path, corruption
//! detection, and the exact bytes of a reference frame.

use protocol::{
    ChecksumMode, DeviceCatalog, DeviceIdentity, Message, MessageKind, ParamValue, ParamValues,
    ProtocolError, StaticCatalog, SubscriptionResponse, decode_frame, encode_frame,
    message_to_bytes, parse_message,
};

fn sample_messages() -> Vec<Message> {
    let catalog = StaticCatalog::builtin();
    let flag = catalog.require(5).unwrap();
    let servo = catalog.require(7).unwrap();

    let mut flag_values = ParamValues::new();
    flag_values.insert(0, ParamValue::Bool(true));
    flag_values.insert(3, ParamValue::Bool(false));

    let mut servo_values = ParamValues::new();
    servo_values.insert(1, ParamValue::Float(-0.5));

    vec![
        Message::ping(),
        Message::disable(),
        Message::heartbeat_request(0),
        Message::heartbeat_response(200),
        Message::subscription_request(flag, &["mode", "led4"], 25).unwrap(),
        Message::subscription_response(&SubscriptionResponse {
            params: 0x7F,
            delay_ms: 25,
            identity: DeviceIdentity::new(5, 19, 0x0123_4567_89AB_CDEF),
        }),
        Message::device_read(servo, &["servo0"]).unwrap(),
        Message::device_write(flag, &flag_values).unwrap(),
        Message::device_data(servo, &servo_values).unwrap(),
        Message::log("encoder calibrated").unwrap(),
        Message::error(0xFD),
    ]
}

mod frame_roundtrip {
    use super::*;

    #[test]
    fn test_every_kind_roundtrips() {
        for mode in [ChecksumMode::Xor, ChecksumMode::LegacyFold] {
            for msg in sample_messages() {
                let frame = encode_frame(&msg, mode).expect("Failed to encode");
                let decoded = decode_frame(&frame, mode).expect("Failed to decode");
                assert_eq!(decoded, msg, "{:?} under {:?}", msg.kind(), mode);
            }
        }
    }

    #[test]
    fn test_frames_have_single_zero() {
        for msg in sample_messages() {
            let frame = encode_frame(&msg, ChecksumMode::Xor).unwrap();
            assert_eq!(frame[0], 0x00);
            assert_eq!(frame[1] as usize, frame.len() - 2);
            assert!(
                !frame[1..].contains(&0),
                "{:?} frame carries an inner zero",
                msg.kind()
            );
        }
    }

    #[test]
    fn test_reference_heartbeat_frame() {
        let msg = Message::new(MessageKind::HeartbeatRequest, vec![0x00]).unwrap();
        assert_eq!(
            message_to_bytes(&msg, ChecksumMode::Xor),
            vec![0x17, 0x01, 0x00, 0x16]
        );
        assert_eq!(
            encode_frame(&msg, ChecksumMode::Xor).unwrap(),
            vec![0x00, 0x05, 0x03, 0x17, 0x01, 0x02, 0x16]
        );
    }
}

mod corruption {
    use super::*;

    #[test]
    fn test_payload_flip_rejected() {
        for msg in sample_messages().into_iter().filter(|m| !m.is_empty()) {
            let mut bytes = message_to_bytes(&msg, ChecksumMode::Xor);
            bytes[2] ^= 0x10;
            assert!(
                matches!(
                    parse_message(&bytes, ChecksumMode::Xor),
                    Err(ProtocolError::ChecksumMismatch { .. })
                ),
                "{:?} accepted a corrupted payload",
                msg.kind()
            );
        }
    }

    #[test]
    fn test_id_flip_rejected_under_xor() {
        let mut bytes = message_to_bytes(&Message::ping(), ChecksumMode::Xor);
        bytes[0] = 0x11;
        assert!(matches!(
            parse_message(&bytes, ChecksumMode::Xor),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncation_is_not_a_checksum_error() {
        let bytes = message_to_bytes(&Message::log("short").unwrap(), ChecksumMode::Xor);
        for cut in 0..bytes.len() {
            assert!(
                matches!(
                    parse_message(&bytes[..cut], ChecksumMode::Xor),
                    Err(ProtocolError::Truncated { .. })
                ),
                "cut at {} not reported as truncated",
                cut
            );
        }
    }

    #[test]
    fn test_oversized_payload_for_kind() {
        // Valid checksum, but a Ping must not carry a payload
        let bytes = [0x10, 0x01, 0x05, 0x14];
        assert!(matches!(
            parse_message(&bytes, ChecksumMode::Xor),
            Err(ProtocolError::PayloadTooLarge {
                kind: MessageKind::Ping,
                ..
            })
        ));
    }
}
