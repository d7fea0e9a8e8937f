//! Byte transport beneath a session.
//!
//! Sessions read and write through a boxed [`Transport`]. Implementations
//! report "no data before the deadline" as `Timeout`, which the session
//! propagates as a retryable status. [`MemoryTransport`] is an in-process
//! pair used by tests and for driving two sessions from one thread.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result, Status};

/// Blocking-with-deadline byte stream.
pub trait Transport: Send {
    /// Read into `buf`. `Ok(0)` means the peer closed the stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write from `buf`, returning how much was accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Apply a read deadline.
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    /// Apply a write deadline.
    fn set_write_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Pipe {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory duplex pipe.
///
/// Reads never block: an empty, open pipe returns `Timeout`.
#[derive(Debug)]
pub struct MemoryTransport {
    inbound: Arc<Mutex<Pipe>>,
    outbound: Arc<Mutex<Pipe>>,
    write_limit: Option<usize>,
}

fn lock_failed(status: Status) -> Error {
    Error::with_detail(status, "memory transport lock poisoned")
}

impl MemoryTransport {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Mutex::new(Pipe::default()));
        let b = Arc::new(Mutex::new(Pipe::default()));
        (
            Self {
                inbound: Arc::clone(&a),
                outbound: Arc::clone(&b),
                write_limit: None,
            },
            Self {
                inbound: b,
                outbound: a,
                write_limit: None,
            },
        )
    }

    /// Accept at most `limit` bytes per write call.
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit.max(1));
        self
    }

    /// Close the sending direction.
    pub fn close(&self) {
        if let Ok(mut pipe) = self.outbound.lock() {
            pipe.closed = true;
        }
    }

    /// Bytes waiting to be read by this end.
    pub fn pending(&self) -> usize {
        self.inbound.lock().map(|pipe| pipe.bytes.len()).unwrap_or(0)
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut pipe = self.inbound.lock().map_err(|_| lock_failed(Status::Read))?;
        if pipe.bytes.is_empty() {
            if pipe.closed {
                return Ok(0);
            }
            return Err(Error::new(Status::Timeout));
        }
        let n = buf.len().min(pipe.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(pipe.bytes.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut pipe = self.outbound.lock().map_err(|_| lock_failed(Status::Write))?;
        if pipe.closed {
            return Err(Error::with_detail(Status::Write, "pipe closed"));
        }
        let n = self.write_limit.map_or(buf.len(), |limit| buf.len().min(limit));
        pipe.bytes.extend(&buf[..n]);
        Ok(n)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
        if let Ok(mut pipe) = self.inbound.lock() {
            pipe.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_is_duplex() {
        let (mut a, mut b) = MemoryTransport::pair();
        assert_eq!(a.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        b.write(b"pong").unwrap();
        assert_eq!(a.read(&mut buf).unwrap(), 4);
    }

    #[test]
    fn test_empty_read_times_out_until_closed() {
        let (mut a, b) = MemoryTransport::pair();
        let mut buf = [0u8; 4];
        assert_eq!(a.read(&mut buf).unwrap_err().status(), Status::Timeout);
        drop(b);
        assert_eq!(a.read(&mut buf).unwrap(), 0);
        assert_eq!(a.write(b"x").unwrap_err().status(), Status::Write);
    }

    #[test]
    fn test_write_limit() {
        let (a, mut b) = MemoryTransport::pair();
        let mut a = a.with_write_limit(3);
        assert_eq!(a.write(b"abcdef").unwrap(), 3);
        assert_eq!(b.pending(), 3);
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 3);
    }
}
