//! Property-based tests for the wire format and validators.
//!
//! Uses proptest to check alignment laws and that no decoder or validator
//! panics on arbitrary input.

use proptest::prelude::*;

use std::net::SocketAddr;

use stagewire::config::ProtocolConfig;
use stagewire::params::StageCParams;
use stagewire::session::ServerSession;
use stagewire::Config;

fn session(align: usize, secret: u32) -> ServerSession {
    let mut config = Config::default();
    config.protocol.byte_align = align;
    let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let mut session = ServerSession::new(&config, peer);
    session.issue(secret);
    session
}

fn alignment() -> impl Strategy<Value = usize> {
    prop::sample::select(vec![1usize, 2, 4, 8])
}

// ============================================================================
// Alignment Properties
// ============================================================================

mod alignment_properties {
    use super::*;
    use stagewire::align::{aligned_len, pad, padding, strip};

    proptest! {
        /// Aligned length is the smallest multiple of `align` not below `len`
        #[test]
        fn aligned_len_is_smallest_multiple(align in alignment(), len in 0usize..10_000) {
            let aligned = aligned_len(align, len);
            prop_assert_eq!(aligned % align, 0);
            prop_assert!(aligned >= len);
            prop_assert!(aligned - len < align);
            prop_assert_eq!(padding(align, len), aligned - len);
        }

        /// Aligning twice changes nothing
        #[test]
        fn aligned_len_is_idempotent(align in alignment(), len in 0usize..10_000) {
            let once = aligned_len(align, len);
            prop_assert_eq!(aligned_len(align, once), once);
        }

        /// Padding appends zeros only, and stripping recovers the input
        #[test]
        fn pad_then_strip(align in alignment(), bytes in prop::collection::vec(any::<u8>(), 0..200)) {
            let padded = pad(align, &bytes);
            prop_assert_eq!(padded.len(), aligned_len(align, bytes.len()));
            prop_assert!(padded[bytes.len()..].iter().all(|&b| b == 0));
            prop_assert_eq!(strip(&padded, bytes.len()), Some(&bytes[..]));
        }
    }
}

// ============================================================================
// Header Properties
// ============================================================================

mod header_properties {
    use super::*;
    use stagewire::{Header, HEADER_LEN};

    proptest! {
        /// Header decode inverts encode for every field value
        #[test]
        fn header_roundtrip(
            payload_len in any::<u32>(),
            secret in any::<u32>(),
            step in any::<u16>(),
            id in any::<u16>(),
        ) {
            let header = Header::new(payload_len, secret, step, id);
            let bytes = header.to_bytes();
            prop_assert_eq!(bytes.len(), HEADER_LEN);
            prop_assert_eq!(Header::decode(&bytes).unwrap(), header);
        }

        /// Short buffers are rejected, never read past
        #[test]
        fn short_header_is_rejected(bytes in prop::collection::vec(any::<u8>(), 0..HEADER_LEN)) {
            prop_assert!(Header::decode(&bytes).is_err());
        }
    }
}

// ============================================================================
// Validator Properties
// ============================================================================

mod validator_properties {
    use super::*;
    use stagewire::frame::{stage_a_request, stage_d_request, StageBMessage};
    use stagewire::handler::{check_stage_b, check_stage_d, validate_stage_a, AckVerdict};

    proptest! {
        /// Client-built Stage-A requests always validate
        #[test]
        fn stage_a_request_validates(align in alignment()) {
            let config = ProtocolConfig { byte_align: align, ..ProtocolConfig::default() };
            let request = stage_a_request(align, config.identifier);
            prop_assert!(validate_stage_a(&config, &request).is_ok());
        }

        /// Client-built Stage-B messages validate as the current ack
        #[test]
        fn stage_b_message_validates(
            align in alignment(),
            length in 0u32..256,
            secret in 1u32..=10_000,
            ack in 0u32..32,
        ) {
            let session = session(align, secret);
            let mut message = StageBMessage::new(align, length, secret, session.identifier);
            message.set_ack(ack);
            let verdict = check_stage_b(&session, length, ack, message.as_bytes());
            prop_assert_eq!(verdict.unwrap(), AckVerdict::Current);
        }

        /// Client-built Stage-D frames validate
        #[test]
        fn stage_d_frame_validates(
            align in alignment(),
            length in 0u32..256,
            secret in 1u32..=10_000,
            fill in b'a'..=b'z',
        ) {
            let session = session(align, secret);
            let params = StageCParams { count: 1, length, secret, fill };
            let frame = stage_d_request(align, length, secret, session.identifier, fill);
            prop_assert!(check_stage_d(&session, &params, &frame).is_ok());
        }

        /// Flipping any single byte of a Stage-D frame is detected
        #[test]
        fn stage_d_corruption_is_detected(
            length in 1u32..64,
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let session = session(4, 77);
            let params = StageCParams { count: 1, length, secret: 77, fill: b'q' };
            let mut frame = stage_d_request(4, length, 77, session.identifier, b'q').to_vec();
            // Alignment padding is not inspected; stay within header and payload.
            let i = index.index(12 + length as usize);
            frame[i] ^= flip;
            prop_assert!(check_stage_d(&session, &params, &frame).is_err());
        }
    }
}

// ============================================================================
// Fuzzing Properties
// ============================================================================

mod fuzz_properties {
    use super::*;
    use stagewire::frame::{
        decode_message, parse_stage_b_data, StageAReply, StageBAck, StageBCompletion,
        StageCReply, StageDReply,
    };
    use stagewire::handler::{check_stage_b, check_stage_d, validate_stage_a};
    use stagewire::{Header, Stage};

    proptest! {
        /// Decoders return errors on garbage instead of panicking
        #[test]
        fn decoders_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = Header::decode(&bytes);
            let _ = decode_message::<StageAReply>(Stage::A, &bytes);
            let _ = decode_message::<StageBAck>(Stage::B, &bytes);
            let _ = decode_message::<StageBCompletion>(Stage::B, &bytes);
            let _ = decode_message::<StageCReply>(Stage::C, &bytes);
            let _ = decode_message::<StageDReply>(Stage::D, &bytes);
            let _ = parse_stage_b_data(&bytes);
        }

        /// Validators return errors on garbage instead of panicking
        #[test]
        fn validators_never_panic(
            bytes in prop::collection::vec(any::<u8>(), 0..256),
            align in alignment(),
            length in 0u32..512,
            expected_ack in 0u32..64,
        ) {
            let config = ProtocolConfig { byte_align: align, ..ProtocolConfig::default() };
            let _ = validate_stage_a(&config, &bytes);

            let session = session(align, 1234);
            let _ = check_stage_b(&session, length, expected_ack, &bytes);

            let params = StageCParams { count: 1, length, secret: 1234, fill: b'x' };
            let _ = check_stage_d(&session, &params, &bytes);
        }
    }
}
