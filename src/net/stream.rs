//! Buffered socket streams owned by a connection.
//!
//! `ReadStream::position` counts every byte handed to a consumer. Duplex stall
//! detection compares it before and after a handler call, so every read path
//! (`Read`, `BufRead`, `consume`) goes through the same counter.

use std::io::{self, BufRead, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Result of waiting for input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Buffered bytes are available.
    Data,
    /// Nothing arrived within the wait.
    Idle,
    /// The peer closed its side.
    Eof,
}

/// Buffered reader over a connection's socket.
#[derive(Debug)]
pub struct ReadStream {
    socket: TcpStream,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    position: u64,
    read_timeout: Duration,
    eof: bool,
}

impl ReadStream {
    /// `buf` is reused as-is; its length is the read chunk size.
    pub fn new(socket: TcpStream, mut buf: Vec<u8>, read_timeout: Duration) -> Self {
        if buf.is_empty() {
            buf.resize(crate::net::recycle::DEFAULT_BUFFER_SIZE, 0);
        }
        Self {
            socket,
            buf,
            start: 0,
            end: 0,
            position: 0,
            read_timeout: read_timeout.max(MIN_TIMEOUT),
            eof: false,
        }
    }

    /// Total bytes consumed from this stream.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes buffered and not yet consumed.
    pub fn available(&self) -> usize {
        self.end - self.start
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.available() == 0
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout.max(MIN_TIMEOUT);
    }

    /// Wait up to `timeout` for input. A zero timeout is a non-blocking check.
    pub fn wait_for_data(&mut self, timeout: Duration) -> io::Result<Readiness> {
        if self.available() > 0 {
            return Ok(Readiness::Data);
        }
        if self.eof {
            return Ok(Readiness::Eof);
        }
        if timeout.is_zero() {
            return self.try_fill();
        }

        self.socket.set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
        let result = self.fill_once();
        self.socket.set_read_timeout(Some(self.read_timeout))?;
        result
    }

    /// Non-blocking fill attempt.
    pub fn try_fill(&mut self) -> io::Result<Readiness> {
        if self.available() > 0 {
            return Ok(Readiness::Data);
        }
        self.socket.set_nonblocking(true)?;
        let result = self.fill_once();
        self.socket.set_nonblocking(false)?;
        result
    }

    /// Give the buffer back for recycling.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }

    fn fill_once(&mut self) -> io::Result<Readiness> {
        self.start = 0;
        self.end = 0;
        loop {
            match self.socket.read(&mut self.buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(Readiness::Eof);
                }
                Ok(n) => {
                    self.end = n;
                    return Ok(Readiness::Data);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(Readiness::Idle);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Read for ReadStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = {
            let available = self.fill_buf()?;
            let n = available.len().min(out.len());
            out[..n].copy_from_slice(&available[..n]);
            n
        };
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for ReadStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.available() == 0 && !self.eof {
            match self.fill_once()? {
                Readiness::Idle => {
                    return Err(io::Error::new(ErrorKind::TimedOut, "read timed out"));
                }
                Readiness::Data | Readiness::Eof => {}
            }
        }
        Ok(&self.buf[self.start..self.end])
    }

    fn consume(&mut self, amt: usize) {
        let amt = amt.min(self.available());
        self.start += amt;
        self.position += amt as u64;
    }
}

/// Buffered writer over a connection's socket.
#[derive(Debug)]
pub struct WriteStream {
    socket: TcpStream,
    buf: Vec<u8>,
    capacity: usize,
    position: u64,
}

impl WriteStream {
    pub fn new(socket: TcpStream, mut buf: Vec<u8>, capacity: usize) -> Self {
        buf.clear();
        let capacity = capacity.max(1);
        buf.reserve(capacity);
        Self {
            socket,
            buf,
            capacity,
            position: 0,
        }
    }

    /// Total bytes accepted for writing.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes buffered and not yet flushed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Give the buffer back for recycling. Unflushed bytes are discarded.
    pub fn into_buffer(mut self) -> Vec<u8> {
        self.buf.clear();
        self.buf
    }

    fn flush_buf(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let result = self.socket.write_all(&self.buf);
            self.buf.clear();
            result?;
        }
        Ok(())
    }
}

impl Write for WriteStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.capacity {
            self.flush_buf()?;
        }
        if data.len() >= self.capacity {
            self.socket.write_all(data)?;
        } else {
            self.buf.extend_from_slice(data);
        }
        self.position += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buf()?;
        self.socket.flush()
    }
}
