use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use memchr::memchr;
use std::str;

/// Largest bulk string accepted from a client (matches Redis' proto-max-bulk-len)
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest number of elements accepted in a single array header
const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Deepest array nesting accepted; requests themselves are one level
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(String),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::SimpleString(Bytes::from_static(b"OK"))
    }

    pub fn simple(s: &'static str) -> Self {
        RespValue::SimpleString(Bytes::from_static(s.as_bytes()))
    }

    pub fn bulk(s: impl Into<Bytes>) -> Self {
        RespValue::BulkString(Some(s.into()))
    }

    pub fn null() -> Self {
        RespValue::BulkString(None)
    }

    pub fn array(items: Vec<RespValue>) -> Self {
        RespValue::Array(Some(items))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}

/// Incremental RESP decoder
///
/// Bytes are fed as they arrive from the socket; `parse_next` yields one
/// complete value at a time and keeps any partial tail buffered.
pub struct RespParser {
    buffer: BytesMut,
    position: usize,
}

impl RespParser {
    pub fn new() -> Self {
        Self::with_capacity(4 * 1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            position: 0,
        }
    }

    /// Feed data into the parser
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes received but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// Drop everything buffered, used after a protocol error
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.position = 0;
    }

    /// Parse next complete RESP value, `Ok(None)` when more data is needed
    pub fn parse_next(&mut self) -> Result<Option<RespValue>> {
        if self.position >= self.buffer.len() {
            return Ok(None);
        }

        let Some((value, consumed)) = parse_value(&self.buffer[self.position..], 0)? else {
            return Ok(None);
        };
        self.position += consumed;

        if self.position == self.buffer.len() {
            self.reset();
        } else if self.position > self.buffer.len() / 2 {
            let _ = self.buffer.split_to(self.position);
            self.position = 0;
        }

        Ok(Some(value))
    }
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

type Parsed = Option<(RespValue, usize)>;

fn parse_value(buf: &[u8], depth: usize) -> Result<Parsed> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };

    match marker {
        b'+' => Ok(line(buf)?.map(|(text, used)| {
            (RespValue::SimpleString(Bytes::copy_from_slice(text)), used)
        })),
        b'-' => match line(buf)? {
            Some((text, used)) => {
                let msg = str::from_utf8(text)
                    .map_err(|_| Error::Protocol("invalid UTF-8 in error".to_string()))?;
                Ok(Some((RespValue::Error(msg.to_string()), used)))
            }
            None => Ok(None),
        },
        b':' => match line(buf)? {
            Some((text, used)) => Ok(Some((RespValue::Integer(parse_int(text)?), used))),
            None => Ok(None),
        },
        b'$' => parse_bulk_string(buf),
        b'*' => parse_array(buf, depth + 1),
        other => Err(Error::Protocol(format!(
            "expected '*', got '{}'",
            other.escape_ascii()
        ))),
    }
}

/// `$6\r\nfoobar\r\n` or `$-1\r\n`
fn parse_bulk_string(buf: &[u8]) -> Result<Parsed> {
    let Some((header, header_len)) = line(buf)? else {
        return Ok(None);
    };

    let len = parse_int(header)?;
    if len < 0 {
        return Ok(Some((RespValue::BulkString(None), header_len)));
    }
    let len = len as usize;
    if len > MAX_BULK_LEN {
        return Err(Error::Protocol("invalid bulk length".to_string()));
    }

    let end = header_len + len;
    if buf.len() < end + 2 {
        return Ok(None);
    }
    if &buf[end..end + 2] != b"\r\n" {
        return Err(Error::Protocol("missing CRLF after bulk string".to_string()));
    }

    let data = Bytes::copy_from_slice(&buf[header_len..end]);
    Ok(Some((RespValue::BulkString(Some(data)), end + 2)))
}

/// `*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n` or `*-1\r\n`
fn parse_array(buf: &[u8], depth: usize) -> Result<Parsed> {
    if depth > MAX_DEPTH {
        return Err(Error::Protocol("nested arrays too deep".to_string()));
    }
    let Some((header, mut pos)) = line(buf)? else {
        return Ok(None);
    };

    let len = parse_int(header)?;
    if len < 0 {
        return Ok(Some((RespValue::Array(None), pos)));
    }
    let len = len as usize;
    if len > MAX_ARRAY_LEN {
        return Err(Error::Protocol("invalid multibulk length".to_string()));
    }

    let mut elements = Vec::with_capacity(len.min(64));
    for _ in 0..len {
        match parse_value(&buf[pos..], depth)? {
            Some((value, used)) => {
                elements.push(value);
                pos += used;
            }
            None => return Ok(None),
        }
    }

    Ok(Some((RespValue::Array(Some(elements)), pos)))
}

/// Returns the payload between the type marker and CRLF, plus the bytes used
fn line(buf: &[u8]) -> Result<Option<(&[u8], usize)>> {
    let mut from = 1;
    while let Some(offset) = memchr(b'\r', &buf[from..]) {
        let cr = from + offset;
        match buf.get(cr + 1) {
            Some(b'\n') => return Ok(Some((&buf[1..cr], cr + 2))),
            Some(_) => from = cr + 1,
            None => return Ok(None),
        }
    }
    Ok(None)
}

fn parse_int(text: &[u8]) -> Result<i64> {
    str::from_utf8(text)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::Protocol(format!("invalid integer '{}'", text.escape_ascii()))
        })
}

/// Format a value as RESP into a fresh buffer
pub fn encode(value: &RespValue) -> Vec<u8> {
    let mut out = Vec::with_capacity(estimate_resp_size(value));
    write_resp_value(&mut out, value);
    out
}

/// Append the RESP form of `value` to `buf`
pub fn write_resp_value(buf: &mut Vec<u8>, value: &RespValue) {
    match value {
        RespValue::SimpleString(s) => {
            buf.push(b'+');
            buf.extend_from_slice(s);
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::Error(e) => {
            buf.push(b'-');
            buf.extend_from_slice(e.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(n) => {
            buf.push(b':');
            buf.extend_from_slice(itoa::Buffer::new().format(*n).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::BulkString(Some(s)) => {
            write_header(buf, b'$', s.len());
            buf.extend_from_slice(s);
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::BulkString(None) => buf.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(Some(items)) => {
            write_header(buf, b'*', items.len());
            for item in items {
                write_resp_value(buf, item);
            }
        }
        RespValue::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
    }
}

#[inline]
fn write_header(buf: &mut Vec<u8>, marker: u8, len: usize) {
    buf.push(marker);
    buf.extend_from_slice(itoa::Buffer::new().format(len).as_bytes());
    buf.extend_from_slice(b"\r\n");
}

#[inline]
fn estimate_resp_size(value: &RespValue) -> usize {
    match value {
        RespValue::SimpleString(s) => s.len() + 3,
        RespValue::Error(e) => e.len() + 3,
        RespValue::Integer(_) => 24,
        RespValue::BulkString(Some(s)) => s.len() + 16,
        RespValue::BulkString(None) | RespValue::Array(None) => 5,
        RespValue::Array(Some(items)) => 16 + items.iter().map(estimate_resp_size).sum::<usize>(),
    }
}
