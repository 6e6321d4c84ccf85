//! Length-prefixed JSON-RPC framing codec (C1): an HTTP-like header block terminated by
//! `\r\n\r\n`, a mandatory `Content-Length` header, and exactly that many bytes of UTF-8 JSON.

use serde_json::Value;

use crate::error::FramingError;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Default cap on a single message body, matching the kind of guard rail a long-lived stdio
/// transport needs against a misbehaving peer. 64 MiB.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Encodes a single JSON value into a framed byte buffer: `Content-Length: N\r\n\r\n<body>`.
pub fn encode(value: &Value) -> Vec<u8> {
    let body = serde_json::to_vec(value).expect("Value serialization is infallible");
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    out
}

/// Incremental decoder. Feed it arbitrary byte chunks via [`Decoder::feed`]; it buffers internally
/// and yields zero or more complete messages per call. A malformed body does not poison the
/// stream: the decoder discards exactly the `Content-Length`-declared bytes and resynchronizes on
/// the next header block.
#[derive(Debug, Default)]
pub struct Decoder {
    buffer: Vec<u8>,
    max_message_bytes: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder { buffer: Vec::new(), max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES }
    }

    pub fn with_max_message_bytes(max_message_bytes: usize) -> Self {
        Decoder { buffer: Vec::new(), max_message_bytes }
    }

    /// Appends `bytes` to the internal buffer and decodes as many complete messages as are
    /// available. Returns one [`DecodeEvent`] per decoded message or per recoverable error
    /// encountered along the way; an `IncompleteHeaders`/not-enough-body condition simply stops
    /// the loop and waits for the next `feed` call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<DecodeEvent>, FramingError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            let Some(header_end) = find_subslice(&self.buffer, HEADER_TERMINATOR) else {
                break;
            };

            let header_block = &self.buffer[..header_end];
            let content_length = match parse_content_length(header_block) {
                Ok(len) => len,
                Err(FramingError::MissingContentLength) => {
                    return Err(FramingError::MissingContentLength);
                }
                Err(other) => return Err(other),
            };

            if content_length > self.max_message_bytes {
                return Err(FramingError::OversizeMessage {
                    size: content_length,
                    cap: self.max_message_bytes,
                });
            }

            let body_start = header_end + HEADER_TERMINATOR.len();
            let body_end = body_start + content_length;
            if self.buffer.len() < body_end {
                // Not enough body yet; wait for more bytes.
                break;
            }

            let body = self.buffer[body_start..body_end].to_vec();
            self.buffer.drain(..body_end);

            match std::str::from_utf8(&body) {
                Err(_) => events.push(DecodeEvent::Error(FramingError::InvalidUtf8)),
                Ok(text) => match serde_json::from_str::<Value>(text) {
                    Ok(value) => events.push(DecodeEvent::Message(value)),
                    Err(err) => events.push(DecodeEvent::Error(FramingError::MalformedJson(err.to_string()))),
                },
            }
        }

        Ok(events)
    }
}

/// One decoded unit: either a successfully parsed JSON body, or a recoverable per-message error
/// (the decoder has already resynchronized past the offending bytes).
#[derive(Debug)]
pub enum DecodeEvent {
    Message(Value),
    Error(FramingError),
}

fn parse_content_length(header_block: &[u8]) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(header_block).map_err(|_| FramingError::InvalidUtf8)?;
    for line in text.split("\r\n") {
        if let Some(value) = line.strip_prefix("Content-Length:").or_else(|| line.strip_prefix("content-length:")) {
            let value = value.trim();
            return value
                .parse::<usize>()
                .map_err(|_| FramingError::InvalidContentLength(value.to_string()));
        }
    }
    Err(FramingError::MissingContentLength)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let value = serde_json::json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{"x":"héllo 🎉"}});
        let framed = encode(&value);
        let mut decoder = Decoder::new();
        let events = decoder.feed(&framed).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DecodeEvent::Message(decoded) => assert_eq!(decoded, &value),
            DecodeEvent::Error(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn decodes_multiple_messages_fed_at_once() {
        let a = encode(&serde_json::json!({"a":1}));
        let b = encode(&serde_json::json!({"b":2}));
        let mut combined = a;
        combined.extend_from_slice(&b);

        let mut decoder = Decoder::new();
        let events = decoder.feed(&combined).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn incomplete_headers_wait_for_more_bytes() {
        let mut decoder = Decoder::new();
        let events = decoder.feed(b"Content-Length: 10\r\n").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn incomplete_body_waits_for_more_bytes() {
        let framed = encode(&serde_json::json!({"a": 1}));
        let (head, tail) = framed.split_at(framed.len() - 2);

        let mut decoder = Decoder::new();
        let events = decoder.feed(head).unwrap();
        assert!(events.is_empty());

        let events = decoder.feed(tail).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DecodeEvent::Message(_)));
    }

    #[test]
    fn missing_content_length_is_fatal() {
        let mut decoder = Decoder::new();
        let err = decoder.feed(b"Content-Type: application/json\r\n\r\n{}").unwrap_err();
        assert!(matches!(err, FramingError::MissingContentLength));
    }

    #[test]
    fn malformed_json_resyncs_decoder() {
        let mut decoder = Decoder::new();
        let bad = b"Content-Length: 3\r\n\r\nabc";
        let good = encode(&serde_json::json!({"ok": true}));
        let mut combined = bad.to_vec();
        combined.extend_from_slice(&good);

        let events = decoder.feed(&combined).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], DecodeEvent::Error(FramingError::MalformedJson(_))));
        assert!(matches!(events[1], DecodeEvent::Message(_)));
    }

    #[test]
    fn oversize_message_is_rejected() {
        let mut decoder = Decoder::with_max_message_bytes(4);
        let err = decoder.feed(b"Content-Length: 100\r\n\r\n").unwrap_err();
        assert!(matches!(err, FramingError::OversizeMessage { size: 100, cap: 4 }));
    }

    #[test]
    fn content_length_counts_bytes_not_chars() {
        // "héllo" is 5 chars but 6 bytes (é is 2 bytes in UTF-8); Content-Length must reflect that.
        let value = serde_json::json!({"s": "héllo"});
        let framed = encode(&value);
        let text = std::str::from_utf8(&framed).unwrap();
        let declared: usize = text
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let body = serde_json::to_vec(&value).unwrap();
        assert_eq!(declared, body.len());
        assert!(body.len() > value.to_string().chars().count());
    }
}
