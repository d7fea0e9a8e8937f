//! Streaming I/O façade.
//!
//! Every object is driven through the same three calls: `push` bytes in,
//! `flush` to signal the end of input (or force buffered data out), `pop`
//! bytes out. Neither side has to match the other's chunking.

use zeroize::Zeroize;

use crate::credential::ResourceKind;
use crate::error::{Error, Result, Status};

/// Incremental transform driven by push/flush/pop.
pub trait Transform {
    /// Absorb as much of `data` as fits and process it.
    ///
    /// Returns the number of bytes absorbed. A short write is reported as
    /// `Overflow` with [`Error::consumed`] set, so the caller can pop output
    /// and re-submit the remainder. Bytes absorbed before a suspension are
    /// never lost.
    fn push(&mut self, data: &[u8]) -> Result<usize>;

    /// Signal end of input, or force buffered output through.
    fn flush(&mut self) -> Result<()>;

    /// Copy available output into `out`. Returns zero when nothing is
    /// available yet.
    fn pop(&mut self, out: &mut [u8]) -> Result<usize>;

    /// Credential the object is waiting for, if suspended.
    fn required_resource(&self) -> Option<ResourceKind>;

    /// Extended description of the last error.
    fn last_error(&self) -> Option<&str>;
}

/// Fixed-capacity byte FIFO.
///
/// The backing allocation is made once at the full capacity and never
/// grows, so buffered plaintext is never left behind in a reallocated
/// block. Consumed bytes are wiped.
pub struct StreamBuffer {
    data: Vec<u8>,
    start: usize,
    capacity: usize,
}

impl StreamBuffer {
    /// Empty buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| Error::with_detail(Status::Memory, "stream buffer allocation failed"))?;
        Ok(Self {
            data,
            start: 0,
            capacity,
        })
    }

    /// Buffered byte count.
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum buffered byte count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free space.
    pub fn room(&self) -> usize {
        self.capacity - self.len()
    }

    /// Resize an empty buffer.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        if !self.is_empty() {
            return Err(Error::with_detail(
                Status::BadParam,
                "buffer size cannot change while data is buffered",
            ));
        }
        *self = Self::new(capacity)?;
        Ok(())
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        let len = self.len();
        self.data.copy_within(self.start.., 0);
        self.data[len..].zeroize();
        self.data.truncate(len);
        self.start = 0;
    }

    /// Append as much of `bytes` as fits; returns the count appended.
    pub fn write_some(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.room());
        if n == 0 {
            return 0;
        }
        if self.data.len() + n > self.capacity {
            self.compact();
        }
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    /// Append all of `bytes` or nothing.
    pub fn write_all(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.room() {
            return false;
        }
        self.write_some(bytes);
        true
    }

    /// Buffered bytes, oldest first.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Drop `n` bytes from the front, wiping them.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len());
        self.data[self.start..self.start + n].zeroize();
        self.start += n;
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        }
    }

    /// Move up to `out.len()` bytes into `out`.
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        out[..n].copy_from_slice(&self.data[self.start..self.start + n]);
        self.consume(n);
        n
    }

    /// Discard and wipe everything.
    pub fn wipe(&mut self) {
        self.data.zeroize();
        self.start = 0;
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
