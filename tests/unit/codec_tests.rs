//! Unit tests for the NDJSON line codec.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use agent_relay::bridge::codec::{LineCodec, MAX_LINE_BYTES};
use agent_relay::AppError;

// ── Decoding ─────────────────────────────────────────────────────────────────

/// A complete JSON object on a single newline-terminated line is decoded
/// without error and returned without the trailing `\n`.
#[test]
fn single_line_decodes() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"assistant\",\"message\":{}}\n");

    let result = codec
        .decode(&mut buf)
        .expect("decode must succeed for a valid NDJSON line");

    assert_eq!(
        result,
        Some("{\"type\":\"assistant\",\"message\":{}}".to_owned()),
        "codec must return the line content without the trailing newline"
    );
}

/// Two lines delivered in one buffer are decoded as two separate items.
#[test]
fn batched_lines_decode_separately() {
    let mut codec = LineCodec::new();
    let raw = concat!(
        "{\"type\":\"assistant\"}\n",
        "{\"type\":\"control_cancel_request\",\"request_id\":\"r1\"}\n",
    );
    let mut buf = BytesMut::from(raw);

    assert!(codec.decode(&mut buf).expect("first decode").is_some());
    assert!(codec.decode(&mut buf).expect("second decode").is_some());
    assert!(
        codec.decode(&mut buf).expect("empty buffer").is_none(),
        "no further lines must be present"
    );
}

/// A line without its terminating newline is buffered, not emitted.
#[test]
fn partial_line_is_buffered_until_newline() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"assist");

    assert!(
        codec.decode(&mut buf).expect("decode").is_none(),
        "incomplete line must stay buffered"
    );

    buf.extend_from_slice(b"ant\"}\n");
    let result = codec.decode(&mut buf).expect("decode after newline");
    assert_eq!(result, Some("{\"type\":\"assistant\"}".to_owned()));
}

/// A line exceeding the maximum length yields a parse error rather than
/// allocating unbounded memory.
#[test]
fn oversized_line_is_rejected() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_BYTES + 1].as_slice());
    buf.extend_from_slice(b"\n");

    let err = codec
        .decode(&mut buf)
        .expect_err("oversized line must be rejected");

    assert!(
        matches!(err, AppError::Parse(ref msg) if msg.contains("line too long")),
        "expected Parse(line too long), got {err:?}"
    );
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Encoding appends the newline delimiter.
#[test]
fn encode_appends_newline() {
    let mut codec = LineCodec::new();
    let mut dst = BytesMut::new();

    codec
        .encode("{\"type\":\"control_request\"}".to_owned(), &mut dst)
        .expect("encode must succeed");

    assert_eq!(&dst[..], b"{\"type\":\"control_request\"}\n");
}
