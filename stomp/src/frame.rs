//! STOMP 1.2 frames and their wire encoding.
//!
//! A frame is a command line, `name:value` header lines, an empty line and a
//! body terminated by NUL. Bodies carrying a `content-length` header may
//! contain NUL bytes. Bare EOLs between frames are heart-beats and are skipped.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use internals::{ProbeError, Result};

/// Upper bound for a single buffered frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const CONTENT_LENGTH: &str = "content-length";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(match raw {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(ProbeError::Frame(format!("unknown command '{}'", other))),
        })
    }

    // CONNECT and CONNECTED headers are sent verbatim
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Frame {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Returns the first value of a header; repeated headers keep the first
    /// occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let escape = self.command.escapes_headers();
        dst.reserve(self.encoded_len_hint());
        dst.put_slice(self.command.as_str().as_bytes());
        dst.put_u8(b'\n');

        for (name, value) in &self.headers {
            if name == CONTENT_LENGTH {
                continue;
            }
            put_header_part(dst, name, escape);
            dst.put_u8(b':');
            put_header_part(dst, value, escape);
            dst.put_u8(b'\n');
        }
        if !self.body.is_empty() {
            dst.put_slice(CONTENT_LENGTH.as_bytes());
            dst.put_u8(b':');
            dst.put_slice(self.body.len().to_string().as_bytes());
            dst.put_u8(b'\n');
        }

        dst.put_u8(b'\n');
        dst.put_slice(&self.body);
        dst.put_u8(0);
    }

    fn encoded_len_hint(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len() + 2)
            .sum();
        self.command.as_str().len() + headers + self.body.len() + 32
    }

    /// Decodes one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered. Leading
    /// heart-beat EOLs are consumed even when no frame follows.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>> {
        let skipped = heartbeat_prefix_len(src);
        src.advance(skipped);
        if src.is_empty() {
            return Ok(None);
        }

        let mut pos = 0;
        let mut command = None;
        let mut headers = Vec::new();
        loop {
            let Some(newline) = src[pos..].iter().position(|b| *b == b'\n') else {
                return incomplete(src.len());
            };
            let mut line = &src[pos..pos + newline];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            pos += newline + 1;

            let line = std::str::from_utf8(line)
                .map_err(|_| ProbeError::Frame("frame head is not valid UTF-8".to_string()))?;
            match command {
                None => command = Some(Command::parse(line)?),
                Some(_) if line.is_empty() => break,
                Some(cmd) => headers.push(parse_header(line, cmd.escapes_headers())?),
            }
        }
        let command = command.ok_or_else(|| ProbeError::Frame("missing command".to_string()))?;

        let content_length = headers
            .iter()
            .find(|(name, _)| name == CONTENT_LENGTH)
            .map(|(_, value)| {
                value.parse::<usize>().map_err(|_| {
                    ProbeError::Frame(format!("invalid content-length '{}'", value))
                })
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) => {
                if len > MAX_FRAME_SIZE {
                    return Err(ProbeError::Frame(format!(
                        "frame body of {} bytes exceeds the limit",
                        len
                    )));
                }
                if src.len() < pos + len + 1 {
                    return Ok(None);
                }
                if src[pos + len] != 0 {
                    return Err(ProbeError::Frame(
                        "frame body is not terminated by NUL".to_string(),
                    ));
                }
                pos + len
            }
            None => match src[pos..].iter().position(|b| *b == 0) {
                Some(offset) => pos + offset,
                None => return incomplete(src.len() - pos),
            },
        };

        let mut frame_bytes = src.split_to(body_end + 1);
        frame_bytes.advance(pos);
        frame_bytes.truncate(body_end - pos);

        Ok(Some(Frame {
            command,
            headers,
            body: frame_bytes.freeze(),
        }))
    }
}

/// `unbounded` counts the buffered bytes of the part still lacking its
/// terminator: the header block, or a body without `content-length`.
fn incomplete(unbounded: usize) -> Result<Option<Frame>> {
    if unbounded > MAX_FRAME_SIZE {
        return Err(ProbeError::Frame(format!(
            "no complete frame within {} buffered bytes",
            unbounded
        )));
    }
    Ok(None)
}

fn heartbeat_prefix_len(src: &[u8]) -> usize {
    let mut pos = 0;
    loop {
        match src.get(pos) {
            Some(b'\n') => pos += 1,
            Some(b'\r') if src.get(pos + 1) == Some(&b'\n') => pos += 2,
            _ => return pos,
        }
    }
}

fn put_header_part(dst: &mut BytesMut, raw: &str, escape: bool) {
    if !escape {
        dst.put_slice(raw.as_bytes());
        return;
    }
    for byte in raw.bytes() {
        match byte {
            b'\\' => dst.put_slice(b"\\\\"),
            b':' => dst.put_slice(b"\\c"),
            b'\n' => dst.put_slice(b"\\n"),
            b'\r' => dst.put_slice(b"\\r"),
            other => dst.put_u8(other),
        }
    }
}

fn parse_header(line: &str, escape: bool) -> Result<(String, String)> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| ProbeError::Frame(format!("header line without ':': '{}'", line)))?;
    if escape {
        Ok((unescape(name)?, unescape(value)?))
    } else {
        Ok((name.to_string(), value.to_string()))
    }
}

fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('c') => out.push(':'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            other => {
                return Err(ProbeError::Frame(format!(
                    "invalid escape sequence '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf
    }

    #[test]
    fn test_encode_send_frame() {
        let frame = Frame::new(Command::Send)
            .header("destination", "/queue/REQUEST")
            .header("service", "A")
            .with_body(Bytes::from_static(b"hi"));

        assert_eq!(
            &encoded(&frame)[..],
            b"SEND\ndestination:/queue/REQUEST\nservice:A\ncontent-length:2\n\nhi\0"
        );
    }

    #[test]
    fn test_header_escaping() {
        let frame = Frame::new(Command::Send).header("selector", "a:b\\c\nd");
        let mut buf = encoded(&frame);
        assert_eq!(&buf[..], b"SEND\nselector:a\\cb\\\\c\\nd\n\n\0");

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.get("selector"), Some("a:b\\c\nd"));
    }

    #[test]
    fn test_connect_headers_not_escaped() {
        let frame = Frame::new(Command::Connect).header("host", "a:b");
        assert_eq!(&encoded(&frame)[..], b"CONNECT\nhost:a:b\n\n\0");
    }

    #[test]
    fn test_decode_binary_body_with_nul() {
        let body = Bytes::from_static(&[1, 0, 2, 0, 3]);
        let frame = Frame::new(Command::Message)
            .header("correlation-id", "Message to A - 1")
            .with_body(body.clone());
        let mut buf = encoded(&frame);

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.command, Command::Message);
        assert_eq!(decoded.get("correlation-id"), Some("Message to A - 1"));
        assert_eq!(decoded.body, body);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_frame() {
        let frame = Frame::new(Command::Receipt).header("receipt-id", "r-1");
        let full = encoded(&frame);

        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 3..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.get("receipt-id"), Some("r-1"));
    }

    #[test]
    fn test_decode_skips_heartbeats_and_crlf() {
        let mut buf = BytesMut::from(&b"\n\r\n\nCONNECTED\r\nversion:1.2\r\n\r\n\0\n"[..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.command, Command::Connected);
        assert_eq!(decoded.get("version"), Some("1.2"));

        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_body_near_size_limit() {
        let body = Bytes::from(vec![1u8; MAX_FRAME_SIZE - 8]);
        let frame = Frame::new(Command::Message)
            .header("destination", "/queue/REQUEST")
            .header("message-id", "ID:large")
            .with_body(body.clone());
        let full = encoded(&frame);
        assert!(full.len() > MAX_FRAME_SIZE);

        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 1..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.body.len(), body.len());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_frames() {
        let mut declared = BytesMut::from(
            format!("MESSAGE\ncontent-length:{}\n\n", MAX_FRAME_SIZE + 1).as_bytes(),
        );
        assert!(Frame::decode(&mut declared).is_err());

        let mut unterminated = BytesMut::from(&b"MESSAGE\n\n"[..]);
        unterminated.extend_from_slice(&vec![1u8; MAX_FRAME_SIZE + 1]);
        assert!(Frame::decode(&mut unterminated).is_err());
    }

    #[test]
    fn test_decode_two_frames_in_one_buffer() {
        let mut buf = encoded(&Frame::new(Command::Receipt).header("receipt-id", "1"));
        buf.extend_from_slice(&encoded(&Frame::new(Command::Receipt).header("receipt-id", "2")));

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.get("receipt-id"), Some("1"));
        assert_eq!(second.get("receipt-id"), Some("2"));
    }

    #[test]
    fn test_repeated_header_first_wins() {
        let mut buf = BytesMut::from(&b"MESSAGE\nservice:A\nservice:B\n\n\0"[..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.get("service"), Some("A"));
    }

    #[test]
    fn test_decode_errors() {
        let mut unknown = BytesMut::from(&b"PUBLISH\n\n\0"[..]);
        assert!(Frame::decode(&mut unknown).is_err());

        let mut bad_header = BytesMut::from(&b"SEND\nnocolon\n\n\0"[..]);
        assert!(Frame::decode(&mut bad_header).is_err());

        let mut bad_escape = BytesMut::from(&b"SEND\nkey:va\\tlue\n\n\0"[..]);
        assert!(Frame::decode(&mut bad_escape).is_err());

        let mut unterminated = BytesMut::from(&b"SEND\ncontent-length:2\n\nabc\0"[..]);
        assert!(Frame::decode(&mut unterminated).is_err());
    }
}
