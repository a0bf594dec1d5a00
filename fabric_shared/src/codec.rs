//! Wire codec and stream reassembly.
//!
//! The wire format is bare concatenation of JSON objects, `{…}{…}{…}`, with
//! no separator. [`parse`] recovers every whole frame from one read by
//! splicing `}{` into `},{` and parsing the result as an array; unparsable
//! input degrades to a synthetic `error` frame rather than an `Err`, so a
//! malformed peer cannot take down a receive loop.
//!
//! [`StreamDecoder`] is the streaming front end: it buffers bytes across
//! reads and only releases complete objects (outer braces balanced, string
//! contents accounted for), so frames split at arbitrary byte boundaries
//! reassemble intact.

use bytes::BytesMut;

use crate::frame::{codes, Frame};

/// Parses one buffer of bytes into the frames it contains.
///
/// Input is interpreted as UTF-8 with all CR/LF characters stripped. A buffer
/// that fails to parse yields a single `error` frame with code
/// [`codes::NOT_JSON`]; a parse that somehow produces a non-array yields
/// [`codes::NOT_ARRAY`]. An empty buffer yields no frames.
pub fn parse(bytes: &[u8]) -> Vec<Frame> {
    parse_str(&String::from_utf8_lossy(bytes))
}

/// String form of [`parse`].
pub fn parse_str(input: &str) -> Vec<Frame> {
    let stripped: String = input.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let wrapped = format!("[{}]", stripped.replace("}{", "},{"));
    let parsed: serde_json::Value = match serde_json::from_str(&wrapped) {
        Ok(value) => value,
        Err(_) => return vec![Frame::error(codes::NOT_JSON)],
    };
    match parsed {
        serde_json::Value::Array(items) => items.into_iter().map(Frame::from_value).collect(),
        _ => vec![Frame::error(codes::NOT_ARRAY)],
    }
}

/// Decodes a single complete `{…}` chunk released by the stream scanner.
///
/// The chunk boundaries are already known, so no `}{` splicing is applied and
/// string contents survive verbatim.
fn decode_chunk(chunk: &[u8]) -> Frame {
    let text: String = String::from_utf8_lossy(chunk)
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect();
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => Frame::from_value(value),
        Err(_) => Frame::error(codes::NOT_JSON),
    }
}

/// Outcome of scanning the buffer for the next frame boundary.
enum Scan {
    /// A complete object ends at this byte offset (exclusive).
    Complete(usize),
    /// The buffer holds a prefix of an object; wait for more bytes.
    NeedMore,
    /// The buffer cannot open a JSON object.
    Garbage,
}

/// Reassembles frames from a byte stream.
///
/// Feed every read into [`StreamDecoder::feed`]; it returns all frames whose
/// bytes have fully arrived and retains any trailing partial object for the
/// next read.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: BytesMut,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and drains every complete frame currently buffered.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            match scan(&self.buf) {
                Scan::Complete(end) => {
                    let chunk = self.buf.split_to(end);
                    frames.push(decode_chunk(&chunk));
                }
                Scan::NeedMore => break,
                Scan::Garbage => {
                    // Bytes that cannot start an object will never balance;
                    // flush them through the error path instead of buffering
                    // forever.
                    let chunk = self.buf.split();
                    frames.extend(parse(&chunk));
                    break;
                }
            }
        }
        frames
    }

    /// Number of buffered bytes still awaiting a frame boundary.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Finds the end of the first complete top-level JSON object in `buf`.
///
/// CR/LF bytes between frames are tolerated (the codec strips them anyway).
/// Brace depth is tracked outside string literals, with `\`-escape handling,
/// so `{` / `}` inside string values do not move the boundary.
fn scan(buf: &[u8]) -> Scan {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut started = false;

    for (i, &b) in buf.iter().enumerate() {
        if !started {
            match b {
                b'\r' | b'\n' => continue,
                b'{' => started = true,
                _ => return Scan::Garbage,
            }
        }
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Scan::Complete(i + 1);
                }
            }
            _ => {}
        }
    }

    // Either a prefix of an object or only CR/LF buffered so far.
    Scan::NeedMore
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn frame(id: Value, command: Value, data: Value, delivery: Value) -> Frame {
        Frame::from_value(json!({
            "id": id, "command": command, "data": data, "delivery": delivery
        }))
    }

    #[test]
    fn parse_single_frame() {
        let frames = parse(br#"{"id":null,"command":"handshake","data":"c1","delivery":null}"#);
        assert_eq!(
            frames,
            vec![frame(json!(null), json!("handshake"), json!("c1"), json!(null))]
        );
    }

    #[test]
    fn parse_concatenated_frames() {
        let frames = parse(br#"{"command":"a","data":1}{"command":"b","data":2}"#);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].command.as_deref(), Some("a"));
        assert_eq!(frames[1].command.as_deref(), Some("b"));
        assert_eq!(frames[1].data, json!(2));
    }

    #[test]
    fn parse_strips_crlf() {
        let frames = parse(b"{\"command\":\r\n\"a\",\"data\":null}\r\n{\"command\":\"b\"}\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].command.as_deref(), Some("b"));
    }

    #[test]
    fn parse_garbage_yields_not_json_error() {
        let frames = parse(b"definitely not json");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_command("error"));
        assert_eq!(frames[0].data, json!(codes::NOT_JSON));
    }

    #[test]
    fn parse_empty_yields_nothing() {
        assert!(parse(b"").is_empty());
    }

    #[test]
    fn parse_preserves_arbitrary_data_values() {
        // Nested objects, arrays, numbers, and null all survive untouched.
        let payload = json!({"a": [1, 2, {"b": null}], "c": 3.5, "d": {"e": true}});
        let encoded = Frame::command("load", payload.clone()).encode().unwrap();
        let frames = parse(&encoded);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, payload);
    }

    #[test]
    fn roundtrip_matches_original() {
        let original = Frame::full(
            Some("c1".into()),
            Some("sum".into()),
            json!({"a": 1, "b": 2}),
            Some("ab12".into()),
        );
        let frames = parse(&original.encode().unwrap());
        assert_eq!(frames, vec![original]);
    }

    #[test]
    fn decoder_reassembles_arbitrary_splits() {
        let a = Frame::command("first", json!({"n": 1})).encode().unwrap();
        let b = Frame::addressed("c2", "second", json!([1, 2])).encode().unwrap();
        let mut wire = a;
        wire.extend_from_slice(&b);

        for split in 0..=wire.len() {
            let mut decoder = StreamDecoder::new();
            let mut frames = decoder.feed(&wire[..split]);
            frames.extend(decoder.feed(&wire[split..]));
            assert_eq!(frames.len(), 2, "split at {split}");
            assert_eq!(frames[0].command.as_deref(), Some("first"));
            assert_eq!(frames[1].command.as_deref(), Some("second"));
            assert_eq!(decoder.pending(), 0);
        }
    }

    #[test]
    fn decoder_holds_partial_frames() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(br#"{"command":"pa"#).is_empty());
        assert!(decoder.pending() > 0);
        let frames = decoder.feed(br#"rtial","data":7}"#);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command.as_deref(), Some("partial"));
        assert_eq!(frames[0].data, json!(7));
    }

    #[test]
    fn decoder_ignores_braces_inside_strings() {
        let payload = json!({"text": "}{ tricky \"quoted\" {{"});
        let encoded = Frame::command("chat", payload.clone()).encode().unwrap();
        let mut decoder = StreamDecoder::new();
        let frames = decoder.feed(&encoded);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, payload);
    }

    #[test]
    fn decoder_flushes_garbage_as_error_frame() {
        let mut decoder = StreamDecoder::new();
        let frames = decoder.feed(b"not a frame");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, json!(codes::NOT_JSON));
        assert_eq!(decoder.pending(), 0);
    }
}
