//! RESP protocol codec.
//!
//! Incremental frame parser plus the serializer helpers used for replies,
//! the append-only log, and the replication stream. The parser can hand
//! back the exact byte slice a frame was decoded from, which is what the
//! durability and replication paths persist — no re-serialization.

use bytes::Bytes;

/// One decoded RESP value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Bulk payload, if this value is a bulk string.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            RespValue::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Payload of a bulk or simple string (command words come as either).
    pub fn as_text_bytes(&self) -> Option<Bytes> {
        match self {
            RespValue::Bulk(b) => Some(b.clone()),
            RespValue::Simple(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}

enum Step<T> {
    Done(T),
    More,
    Bad,
}

/// Incremental RESP parser over an internal byte buffer.
///
/// `append` new socket data, then call `try_parse_one_with_raw` until it
/// returns `None`. Incomplete frames consume nothing; a malformed frame
/// yields `RespValue::Error("protocol error")`, after which the caller is
/// expected to close the connection.
#[derive(Debug, Default)]
pub struct RespParser {
    buf: Vec<u8>,
}

impl RespParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered, not-yet-consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn try_parse_one(&mut self) -> Option<RespValue> {
        self.try_parse_one_with_raw().map(|(v, _)| v)
    }

    /// Parse one complete frame and return it together with the exact
    /// bytes it was decoded from.
    pub fn try_parse_one_with_raw(&mut self) -> Option<(RespValue, Bytes)> {
        if self.buf.is_empty() {
            return None;
        }
        let mut pos = 0usize;
        match parse_value(&self.buf, &mut pos) {
            Step::Done(v) => {
                let raw = Bytes::copy_from_slice(&self.buf[..pos]);
                self.buf.drain(..pos);
                Some((v, raw))
            }
            Step::More => None,
            Step::Bad => Some((RespValue::Error("protocol error".to_string()), Bytes::new())),
        }
    }
}

fn parse_value(buf: &[u8], pos: &mut usize) -> Step<RespValue> {
    if *pos >= buf.len() {
        return Step::More;
    }
    let prefix = buf[*pos];
    *pos += 1;
    match prefix {
        b'+' => match parse_line(buf, pos) {
            Step::Done(line) => Step::Done(RespValue::Simple(
                String::from_utf8_lossy(line).into_owned(),
            )),
            Step::More => Step::More,
            Step::Bad => Step::Bad,
        },
        b'-' => match parse_line(buf, pos) {
            Step::Done(line) => Step::Done(RespValue::Error(
                String::from_utf8_lossy(line).into_owned(),
            )),
            Step::More => Step::More,
            Step::Bad => Step::Bad,
        },
        b':' => match parse_integer(buf, pos) {
            Step::Done(v) => Step::Done(RespValue::Integer(v)),
            Step::More => Step::More,
            Step::Bad => Step::Bad,
        },
        b'$' => parse_bulk(buf, pos),
        b'*' => parse_array(buf, pos),
        _ => Step::Bad,
    }
}

fn parse_line<'a>(buf: &'a [u8], pos: &mut usize) -> Step<&'a [u8]> {
    let start = *pos;
    let mut i = start;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            *pos = i + 2;
            return Step::Done(&buf[start..i]);
        }
        i += 1;
    }
    Step::More
}

fn parse_integer(buf: &[u8], pos: &mut usize) -> Step<i64> {
    let line = match parse_line(buf, pos) {
        Step::Done(line) => line,
        Step::More => return Step::More,
        Step::Bad => return Step::Bad,
    };
    let text = match std::str::from_utf8(line) {
        Ok(t) => t,
        Err(_) => return Step::Bad,
    };
    match text.parse::<i64>() {
        Ok(v) => Step::Done(v),
        Err(_) => Step::Bad,
    }
}

fn parse_bulk(buf: &[u8], pos: &mut usize) -> Step<RespValue> {
    let len = match parse_integer(buf, pos) {
        Step::Done(v) => v,
        Step::More => return Step::More,
        Step::Bad => return Step::Bad,
    };
    if len == -1 {
        return Step::Done(RespValue::Null);
    }
    if len < 0 {
        return Step::Bad;
    }
    let len = len as usize;
    if buf.len() < *pos + len + 2 {
        return Step::More;
    }
    let payload = &buf[*pos..*pos + len];
    if buf[*pos + len] != b'\r' || buf[*pos + len + 1] != b'\n' {
        return Step::Bad;
    }
    let value = RespValue::Bulk(Bytes::copy_from_slice(payload));
    *pos += len + 2;
    Step::Done(value)
}

fn parse_array(buf: &[u8], pos: &mut usize) -> Step<RespValue> {
    let count = match parse_integer(buf, pos) {
        Step::Done(v) => v,
        Step::More => return Step::More,
        Step::Bad => return Step::Bad,
    };
    if count == -1 {
        return Step::Done(RespValue::Null);
    }
    if count < 0 {
        return Step::Bad;
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match parse_value(buf, pos) {
            Step::Done(v) => items.push(v),
            Step::More => return Step::More,
            Step::Bad => return Step::Bad,
        }
    }
    Step::Done(RespValue::Array(items))
}

// ---- serializer helpers ----

pub fn simple_string(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 3);
    out.push(b'+');
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

pub fn error(msg: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.len() + 3);
    out.push(b'-');
    out.extend_from_slice(msg.as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

pub fn integer(v: i64) -> Vec<u8> {
    format!(":{v}\r\n").into_bytes()
}

pub fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn null_bulk() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn array_header(n: usize) -> Vec<u8> {
    format!("*{n}\r\n").into_bytes()
}

/// Serialize command parts as a RESP array of bulk strings.
///
/// This is the fallback encoding for the append-only log and the framing
/// used for replication broadcasts and the rewrite command stream.
pub fn array_of_bulks<I, T>(parts: I) -> Vec<u8>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let parts: Vec<T> = parts.into_iter().collect();
    let mut out = Vec::with_capacity(16 * parts.len() + 16);
    out.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for p in &parts {
        out.extend_from_slice(&bulk(p.as_ref()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_value(s: &str) -> RespValue {
        RespValue::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn test_parse_simple_string() {
        let mut p = RespParser::new();
        p.append(b"+OK\r\n");
        assert_eq!(p.try_parse_one(), Some(RespValue::Simple("OK".to_string())));
        assert_eq!(p.try_parse_one(), None);
    }

    #[test]
    fn test_parse_command_array() {
        let mut p = RespParser::new();
        p.append(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nhello\r\n");
        let v = p.try_parse_one().unwrap();
        assert_eq!(
            v,
            RespValue::Array(vec![bulk_value("SET"), bulk_value("k"), bulk_value("hello")])
        );
    }

    #[test]
    fn test_incremental_feed_consumes_nothing_until_complete() {
        let mut p = RespParser::new();
        p.append(b"*2\r\n$4\r\nECHO\r\n$3\r\nab");
        assert_eq!(p.try_parse_one(), None);
        assert_eq!(p.buffered(), 22);
        p.append(b"c\r\n");
        let v = p.try_parse_one().unwrap();
        assert_eq!(v, RespValue::Array(vec![bulk_value("ECHO"), bulk_value("abc")]));
        assert_eq!(p.buffered(), 0);
    }

    #[test]
    fn test_raw_bytes_match_input_exactly() {
        let frame = b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n";
        let mut p = RespParser::new();
        p.append(frame);
        let (_, raw) = p.try_parse_one_with_raw().unwrap();
        assert_eq!(raw.as_ref(), frame.as_slice());
    }

    #[test]
    fn test_pipelined_frames() {
        let mut p = RespParser::new();
        p.append(b"+PONG\r\n:42\r\n$-1\r\n");
        assert_eq!(p.try_parse_one(), Some(RespValue::Simple("PONG".to_string())));
        assert_eq!(p.try_parse_one(), Some(RespValue::Integer(42)));
        assert_eq!(p.try_parse_one(), Some(RespValue::Null));
        assert_eq!(p.try_parse_one(), None);
    }

    #[test]
    fn test_null_array() {
        let mut p = RespParser::new();
        p.append(b"*-1\r\n");
        assert_eq!(p.try_parse_one(), Some(RespValue::Null));
    }

    #[test]
    fn test_invalid_prefix_is_protocol_error() {
        let mut p = RespParser::new();
        p.append(b"hello\r\n");
        let v = p.try_parse_one().unwrap();
        assert!(v.is_error());
    }

    #[test]
    fn test_bad_bulk_length_is_protocol_error() {
        let mut p = RespParser::new();
        p.append(b"$-2\r\n");
        assert!(p.try_parse_one().unwrap().is_error());

        let mut p = RespParser::new();
        p.append(b"$abc\r\n");
        assert!(p.try_parse_one().unwrap().is_error());
    }

    #[test]
    fn test_missing_crlf_after_payload_is_protocol_error() {
        let mut p = RespParser::new();
        p.append(b"$3\r\nabcXY");
        assert!(p.try_parse_one().unwrap().is_error());
    }

    #[test]
    fn test_binary_safe_bulk() {
        let mut p = RespParser::new();
        p.append(b"$4\r\na\x00\r b"); // payload contains NUL and CR
        // not complete yet: payload is 4 bytes + CRLF
        assert_eq!(p.try_parse_one(), None);
        let mut p = RespParser::new();
        p.append(b"$4\r\na\x00\rb\r\n");
        let v = p.try_parse_one().unwrap();
        assert_eq!(v.as_bulk().unwrap().as_ref(), b"a\x00\rb");
    }

    #[test]
    fn test_serializers() {
        assert_eq!(simple_string("OK"), b"+OK\r\n".to_vec());
        assert_eq!(error("ERR boom"), b"-ERR boom\r\n".to_vec());
        assert_eq!(integer(-2), b":-2\r\n".to_vec());
        assert_eq!(bulk(b"hello"), b"$5\r\nhello\r\n".to_vec());
        assert_eq!(null_bulk(), b"$-1\r\n".to_vec());
        assert_eq!(
            array_of_bulks(["SET", "k", "v"]),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n".to_vec()
        );
    }

    #[test]
    fn test_serialized_command_parses_back() {
        let encoded = array_of_bulks(["ZADD", "z", "1.5", "m"]);
        let mut p = RespParser::new();
        p.append(&encoded);
        let (v, raw) = p.try_parse_one_with_raw().unwrap();
        assert_eq!(raw.as_ref(), encoded.as_slice());
        match v {
            RespValue::Array(items) => assert_eq!(items.len(), 4),
            other => panic!("expected array, got {other:?}"),
        }
    }
}
