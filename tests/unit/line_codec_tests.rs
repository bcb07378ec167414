//! Unit tests for the NDJSON line framer and outbound line encoding.
//!
//! Covers:
//! - lines split at every byte offset decode to the same frames
//! - CRLF terminators and an unterminated trailing fragment at EOF
//! - oversized lines are reported and skipped without losing the next line
//! - U+2028 / U+2029 are escaped on the way out and survive a parse

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use agent_conduit::diagnostics::{ChannelDiagnostics, DiagnosticKind};
use agent_conduit::transport::codec::{encode_line, escape_line_terminators, Line, LineCodec};
use agent_conduit::transport::reader::{parse_line, run_reader};

fn drain(codec: &mut LineCodec, buf: &mut BytesMut, out: &mut Vec<Line>) {
    while let Some(line) = codec.decode(buf).expect("decode must not fail") {
        out.push(line);
    }
}

fn complete(text: &str) -> Line {
    Line::Complete(Bytes::copy_from_slice(text.as_bytes()))
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// Two lines delivered in two chunks yield the same two lines wherever the
/// chunk boundary falls, including inside a multi-byte character.
#[test]
fn split_at_every_offset_yields_identical_lines() {
    let raw = "{\"type\":\"assistant\",\"text\":\"h\u{e9}llo\"}\n{\"type\":\"result\"}\n";
    let bytes = raw.as_bytes();

    for split in 0..=bytes.len() {
        let mut codec = LineCodec::new();
        let mut out = Vec::new();

        let mut buf = BytesMut::from(&bytes[..split]);
        drain(&mut codec, &mut buf, &mut out);
        buf.extend_from_slice(&bytes[split..]);
        drain(&mut codec, &mut buf, &mut out);
        if let Some(line) = codec.decode_eof(&mut buf).expect("eof decode") {
            out.push(line);
        }

        assert_eq!(
            out,
            vec![
                complete("{\"type\":\"assistant\",\"text\":\"h\u{e9}llo\"}"),
                complete("{\"type\":\"result\"}"),
            ],
            "split at byte {split} changed the framing"
        );
    }
}

/// A single byte at a time is the worst case for partial delivery.
#[test]
fn byte_at_a_time_delivery_is_buffered_until_newline() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::new();
    let mut out = Vec::new();

    for byte in b"{\"a\":1}\r\n{\"b\":2}\n" {
        buf.extend_from_slice(&[*byte]);
        drain(&mut codec, &mut buf, &mut out);
    }

    assert_eq!(out, vec![complete("{\"a\":1}"), complete("{\"b\":2}")]);
}

/// Input ending without a newline still yields its last line at EOF.
#[test]
fn unterminated_fragment_is_flushed_at_eof() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"a\":1}\n{\"b\":2}");
    let mut out = Vec::new();
    drain(&mut codec, &mut buf, &mut out);
    assert_eq!(out.len(), 1, "only the terminated line is complete before EOF");

    let last = codec.decode_eof(&mut buf).expect("eof decode");
    assert_eq!(last, Some(complete("{\"b\":2}")));
    assert_eq!(codec.decode_eof(&mut buf).expect("second eof"), None);
}

/// A line over the limit is reported once with its length; framing resumes
/// at the next line.
#[test]
fn oversized_line_is_skipped_and_framing_resumes() {
    let mut codec = LineCodec::with_max_length(16);
    let long = "x".repeat(40);
    let mut buf = BytesMut::from(format!("{long}\n{{\"ok\":true}}\n").as_str());
    let mut out = Vec::new();
    drain(&mut codec, &mut buf, &mut out);

    assert_eq!(out, vec![Line::Oversized(40), complete("{\"ok\":true}")]);
}

/// An oversized line arriving in pieces is discarded as it streams in.
#[test]
fn oversized_line_in_chunks_is_discarded_incrementally() {
    let mut codec = LineCodec::with_max_length(8);
    let mut out = Vec::new();

    let mut buf = BytesMut::from("0123456789abcdef");
    drain(&mut codec, &mut buf, &mut out);
    assert!(out.is_empty());
    assert!(buf.is_empty(), "discarded bytes must not stay buffered");

    buf.extend_from_slice(b"ghij\n{}\n");
    drain(&mut codec, &mut buf, &mut out);
    assert_eq!(out, vec![Line::Oversized(20), complete("{}")]);
}

// ── Parsing ──────────────────────────────────────────────────────────────────

#[test]
fn whitespace_only_line_is_not_a_frame() {
    assert_eq!(parse_line(b"   \t").expect("blank parses"), None);
    assert_eq!(parse_line(b"").expect("empty parses"), None);
}

#[test]
fn invalid_json_is_a_frame_parse_error() {
    let err = parse_line(b"{not json").expect_err("must fail");
    assert!(matches!(err, agent_conduit::AppError::FrameParse(_)));
}

/// The reader skips a bad line, records it, and keeps delivering frames.
#[tokio::test]
async fn reader_survives_malformed_and_oversized_lines() {
    let (mut agent, engine) = tokio::io::duplex(4096);
    let (sink, mut diagnostics) = ChannelDiagnostics::new();
    let (frame_tx, mut frames) = mpsc::unbounded_channel::<Value>();

    let reader = tokio::spawn(run_reader(
        "test".to_owned(),
        engine,
        32,
        frame_tx,
        Arc::new(sink),
        CancellationToken::new(),
    ));

    let input = format!(
        "{{\"type\":\"system\"}}\nnot json\n{}\n\n{{\"type\":\"result\"}}\n",
        "y".repeat(64)
    );
    tokio::io::AsyncWriteExt::write_all(&mut agent, input.as_bytes())
        .await
        .expect("write input");
    drop(agent);
    reader.await.expect("reader task");

    assert_eq!(frames.recv().await, Some(json!({"type": "system"})));
    assert_eq!(frames.recv().await, Some(json!({"type": "result"})));
    assert_eq!(frames.recv().await, None, "reader ends at EOF");

    let first = diagnostics.recv().await.expect("parse diagnostic");
    assert!(matches!(first.kind, DiagnosticKind::FrameParse { ref line, .. } if line == "not json"));
    let second = diagnostics.recv().await.expect("oversize diagnostic");
    assert_eq!(second.kind, DiagnosticKind::OversizedLine { len: 64 });
}

// ── Outbound ─────────────────────────────────────────────────────────────────

/// Raw separators never reach the wire, and the escaped line decodes back to
/// the original text.
#[test]
fn line_and_paragraph_separators_are_escaped() {
    let frame = json!({"type": "user", "text": "a\u{2028}b\u{2029}c"});
    let line = encode_line(&frame).expect("encode");

    assert!(line.ends_with('\n'));
    assert_eq!(line.matches('\n').count(), 1, "exactly one terminator");
    assert!(!line.contains('\u{2028}') && !line.contains('\u{2029}'));
    assert!(line.contains("\\u2028") && line.contains("\\u2029"));

    let parsed = parse_line(line.trim_end().as_bytes())
        .expect("parse")
        .expect("frame");
    assert_eq!(parsed, frame);
}

#[test]
fn escape_is_identity_without_separators() {
    let text = "{\"k\":\"plain \\n text\"}";
    assert_eq!(escape_line_terminators(text), text);
}

/// Embedded newlines in string values are escaped by serde, so every frame
/// stays on one line.
#[test]
fn embedded_newline_stays_on_one_line() {
    let line = encode_line(&json!({"text": "one\ntwo"})).expect("encode");
    assert_eq!(line, "{\"text\":\"one\\ntwo\"}\n");
}
