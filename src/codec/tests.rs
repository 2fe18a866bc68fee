//! Unit tests for the device frame codec.
//!
//! Covers header decoding, round-tripping, partial input, oversized bodies
//! and EOF handling.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use rstest::rstest;
use tokio_util::codec::{Decoder, Encoder};

use super::*;
use crate::frame::Status;

fn kind_strategy() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Login),
        Just(MessageType::Ping),
        Just(MessageType::Bridge),
        Just(MessageType::Hardware),
    ]
}

proptest! {
    #[test]
    fn body_frames_round_trip(
        kind in kind_strategy(),
        id in any::<u16>(),
        body in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let frame = Frame::new(kind, id, body.clone()).expect("body fits");
        let mut buf = BytesMut::from(&encode(&frame)[..]);
        let decoded = FrameCodec::default()
            .decode(&mut buf)
            .expect("decode should succeed")
            .expect("frame should be complete");

        prop_assert_eq!(decoded.kind(), kind);
        prop_assert_eq!(decoded.id(), id);
        prop_assert_eq!(usize::from(decoded.header().length), body.len());
        prop_assert_eq!(decoded.body().as_ref(), body.as_slice());
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn responses_round_trip(id in any::<u16>(), code in any::<u16>()) {
        let frame = Frame::response(id, Status::new(code));
        let mut buf = BytesMut::from(&encode(&frame)[..]);
        let decoded = FrameCodec::default()
            .decode(&mut buf)
            .expect("decode should succeed")
            .expect("frame should be complete");

        prop_assert_eq!(decoded, frame);
    }
}

#[test]
fn header_fields_are_big_endian() {
    let header = decode_header([20, 0x12, 0x34, 0x00, 0x05]).expect("known type");
    assert_eq!(
        header,
        FrameHeader {
            kind: MessageType::Hardware,
            id: 0x1234,
            length: 5,
        }
    );
}

#[test]
fn encode_writes_header_then_body() {
    let frame = Frame::hardware(0x0102, ["vw", "7"]).expect("small body");
    assert_eq!(
        encode(&frame).as_ref(),
        &[20, 0x01, 0x02, 0x00, 0x04, b'v', b'w', 0, b'7']
    );
}

#[test]
fn response_status_travels_in_length_field() {
    let frame = Frame::response(42, Status::OK);
    assert_eq!(encode(&frame).as_ref(), &[0, 0x00, 0x2a, 0x00, 0xc8]);
}

#[test]
fn response_does_not_consume_following_bytes() {
    let mut buf = BytesMut::new();
    encode_into(&Frame::response(1, Status::OK), &mut buf);
    encode_into(&Frame::ping(2), &mut buf);

    let mut codec = FrameCodec::default();
    let first = codec.decode(&mut buf).expect("decode").expect("frame");
    let second = codec.decode(&mut buf).expect("decode").expect("frame");
    assert_eq!(first.status(), Some(Status::OK));
    assert_eq!(second.kind(), MessageType::Ping);
    assert_eq!(second.id(), 2);
}

#[rstest]
#[case::partial_header(&[20, 0x00][..])]
#[case::header_without_body(&[20, 0x00, 0x01, 0x00, 0x03][..])]
#[case::short_body(&[20, 0x00, 0x01, 0x00, 0x03, b'v'][..])]
fn decode_waits_for_complete_frame(#[case] bytes: &[u8]) {
    let mut buf = BytesMut::from(bytes);
    let result = FrameCodec::default().decode(&mut buf).expect("no error yet");
    assert!(result.is_none());
    assert_eq!(buf.len(), bytes.len());
}

#[test]
fn decode_rejects_unknown_message_type() {
    let mut buf = BytesMut::from(&[9_u8, 0, 1, 0, 0][..]);
    let err = FrameCodec::default()
        .decode(&mut buf)
        .expect_err("type 9 is unknown");
    assert!(matches!(
        err,
        CodecError::Protocol(ProtocolError::UnknownMessageType { type_id: 9 })
    ));
}

#[test]
fn decode_rejects_bodies_over_limit() {
    let mut codec = FrameCodec::new(4);
    let mut buf = BytesMut::from(&[20_u8, 0, 1, 0, 5][..]);
    let err = codec.decode(&mut buf).expect_err("body over limit");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::OversizedFrame { size: 5, max: 4 })
    ));
}

#[test]
fn encode_rejects_bodies_over_limit() {
    let mut codec = FrameCodec::new(2);
    let frame = Frame::hardware(1, ["info"]).expect("small body");
    let mut buf = BytesMut::new();
    let err = codec.encode(frame, &mut buf).expect_err("body over limit");
    assert!(matches!(err, CodecError::Framing(FramingError::OversizedFrame { .. })));
}

#[test]
fn codec_clamps_limit_to_length_field() {
    assert_eq!(FrameCodec::new(usize::MAX).max_body_len(), MAX_BODY_LEN);
}

#[test]
fn decode_eof_with_empty_buffer_returns_none() {
    let mut buf = BytesMut::new();
    let result = FrameCodec::default().decode_eof(&mut buf);
    assert!(matches!(result, Ok(None)), "clean close should return Ok(None), got {result:?}");
}

#[test]
fn decode_eof_mid_header_reports_bytes_received() {
    let mut buf = BytesMut::from(&[20_u8, 0, 1][..]);
    let err = FrameCodec::default()
        .decode_eof(&mut buf)
        .expect_err("truncated header");
    assert!(matches!(
        err,
        CodecError::Eof(EofError::MidHeader {
            bytes_received: 3,
            header_size: HEADER_LEN,
        })
    ));
}

#[test]
fn decode_eof_mid_body_reports_expected_length() {
    let mut buf = BytesMut::from(&[20_u8, 0, 1, 0, 4, b'v', b'w'][..]);
    let err = FrameCodec::default()
        .decode_eof(&mut buf)
        .expect_err("truncated body");
    assert!(matches!(
        err,
        CodecError::Eof(EofError::MidFrame {
            bytes_received: 2,
            expected: 4,
        })
    ));
}

#[test]
fn decode_eof_yields_complete_trailing_frame() {
    let mut buf = BytesMut::from(&encode(&Frame::ping(5))[..]);
    let frame = FrameCodec::default()
        .decode_eof(&mut buf)
        .expect("decode")
        .expect("frame");
    assert_eq!(frame, Frame::ping(5));
    assert_eq!(frame.body(), &Bytes::new());
}
