use crate::error::{Error, Result};
use crate::protocol::resp::write_resp_value;
use crate::protocol::{Command, RespParser, RespValue};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// What a read pass found on the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStatus {
    pub bytes: usize,
    /// The peer shut down its write side
    pub eof: bool,
}

/// A client socket plus its RESP parser and outbound buffer
///
/// The stream is nonblocking; the owning handler drives reads and flushes
/// from readiness events.
pub struct Connection {
    stream: TcpStream,
    id: usize,
    peer: Option<SocketAddr>,

    parser: RespParser,

    write_buffer: Vec<u8>,
    write_position: usize,

    commands_processed: u64,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: Option<SocketAddr>, buffer_size: usize) -> Self {
        Self {
            stream,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            parser: RespParser::with_capacity(buffer_size),
            write_buffer: Vec::with_capacity(buffer_size),
            write_position: 0,
            commands_processed: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn commands_processed(&self) -> u64 {
        self.commands_processed
    }

    /// Read until the socket would block, feeding the parser
    ///
    /// Fails with [`Error::BufferOverflow`] once more than `max_buffered`
    /// bytes of unparsed input pile up.
    pub fn fill(&mut self, scratch: &mut [u8], max_buffered: usize) -> Result<ReadStatus> {
        let mut status = ReadStatus {
            bytes: 0,
            eof: false,
        };

        loop {
            match self.stream.read(scratch) {
                Ok(0) => {
                    status.eof = true;
                    return Ok(status);
                }
                Ok(n) => {
                    self.parser.feed(&scratch[..n]);
                    status.bytes += n;
                    if self.parser.buffered() > max_buffered {
                        return Err(Error::BufferOverflow);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(status),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Next complete command in the input, if one has fully arrived
    pub fn next_command(&mut self) -> Result<Option<Command>> {
        let Some(value) = self.parser.parse_next()? else {
            return Ok(None);
        };
        self.commands_processed += 1;
        Command::from_resp(value).map(Some)
    }

    /// Drop everything buffered after a protocol error
    pub fn discard_input(&mut self) {
        self.parser.reset();
    }

    pub fn queue_reply(&mut self, reply: &RespValue) {
        // Reuse the buffer once every earlier byte has gone out
        if self.write_position >= self.write_buffer.len() {
            self.write_buffer.clear();
            self.write_position = 0;
        }
        write_resp_value(&mut self.write_buffer, reply);
    }

    pub fn consume_writes(&mut self, n: usize) {
        self.write_position += n;
        if self.write_position >= self.write_buffer.len() {
            self.write_buffer.clear();
            self.write_position = 0;
        }
    }

    /// Write as much as the socket takes. Ok(true) once fully drained.
    pub fn flush(&mut self) -> Result<bool> {
        while self.write_position < self.write_buffer.len() {
            match self.stream.write(&self.write_buffer[self.write_position..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => self.consume_writes(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}
