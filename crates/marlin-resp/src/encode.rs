//! Reply encoding.

use bytes::{BufMut, Bytes, BytesMut};

const CRLF: &str = "\r\n";

/// Accumulates RESP replies into one buffer.
///
/// The session encodes a whole reply (possibly nested arrays) into an
/// encoder and flushes the finished buffer to the socket in one write.
#[derive(Debug, Default)]
pub struct ReplyEncoder {
    buf: BytesMut,
}

impl ReplyEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a simple string, e.g. `+OK`.
    pub fn write_simple(&mut self, val: &str) {
        self.buf.put_u8(b'+');
        self.buf.put_slice(val.as_bytes());
        self.buf.put_slice(CRLF.as_bytes());
    }

    /// Writes an error string, e.g. `-ERR message`.
    pub fn write_error(&mut self, msg: &str) {
        self.buf.put_u8(b'-');
        self.buf.put_slice(msg.as_bytes());
        self.buf.put_slice(CRLF.as_bytes());
    }

    /// Writes an integer, e.g. `:42`.
    pub fn write_integer(&mut self, val: i64) {
        self.buf.put_u8(b':');
        self.buf.put_slice(val.to_string().as_bytes());
        self.buf.put_slice(CRLF.as_bytes());
    }

    /// Writes a bulk string.
    pub fn write_bulk(&mut self, val: &str) {
        self.buf.put_u8(b'$');
        self.buf.put_slice(val.len().to_string().as_bytes());
        self.buf.put_slice(CRLF.as_bytes());
        self.buf.put_slice(val.as_bytes());
        self.buf.put_slice(CRLF.as_bytes());
    }

    /// Writes a null bulk string (`$-1`), the "no value" reply.
    pub fn write_null(&mut self) {
        self.buf.put_slice(b"$-1\r\n");
    }

    /// Writes an array header. The caller writes the items afterwards.
    pub fn write_array_header(&mut self, len: usize) {
        self.buf.put_u8(b'*');
        self.buf.put_slice(len.to_string().as_bytes());
        self.buf.put_slice(CRLF.as_bytes());
    }

    /// Writes a flat array of bulk strings.
    pub fn write_string_array(&mut self, items: &[String]) {
        self.write_array_header(items.len());
        for item in items {
            self.write_bulk(item);
        }
    }

    /// Returns the encoded reply, leaving the encoder empty.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Returns true if nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(f: impl FnOnce(&mut ReplyEncoder)) -> Bytes {
        let mut enc = ReplyEncoder::new();
        f(&mut enc);
        enc.into_bytes()
    }

    #[test]
    fn test_write_simple() {
        assert_eq!(&encoded(|e| e.write_simple("PONG"))[..], b"+PONG\r\n");
    }

    #[test]
    fn test_write_error() {
        assert_eq!(
            &encoded(|e| e.write_error("ERR something went wrong"))[..],
            b"-ERR something went wrong\r\n"
        );
    }

    #[test]
    fn test_write_integer() {
        assert_eq!(&encoded(|e| e.write_integer(42))[..], b":42\r\n");
        assert_eq!(&encoded(|e| e.write_integer(-7))[..], b":-7\r\n");
    }

    #[test]
    fn test_write_bulk() {
        assert_eq!(&encoded(|e| e.write_bulk("hello"))[..], b"$5\r\nhello\r\n");
        assert_eq!(&encoded(|e| e.write_bulk(""))[..], b"$0\r\n\r\n");
    }

    #[test]
    fn test_write_null() {
        assert_eq!(&encoded(|e| e.write_null())[..], b"$-1\r\n");
    }

    #[test]
    fn test_write_string_array() {
        let items = vec!["dir".to_string(), "/data".to_string()];
        assert_eq!(
            &encoded(|e| e.write_string_array(&items))[..],
            b"*2\r\n$3\r\ndir\r\n$5\r\n/data\r\n"
        );
    }

    #[test]
    fn test_nested_reply() {
        // An XRANGE-shaped reply: [[id, [field, value]]]
        let got = encoded(|e| {
            e.write_array_header(1);
            e.write_array_header(2);
            e.write_bulk("1-1");
            e.write_array_header(2);
            e.write_bulk("temperature");
            e.write_bulk("20");
        });
        assert_eq!(
            &got[..],
            b"*1\r\n*2\r\n$3\r\n1-1\r\n*2\r\n$11\r\ntemperature\r\n$2\r\n20\r\n"
        );
    }
}
