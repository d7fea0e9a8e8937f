//! Per-segment encoding: optional zstd compression, then STREAM sealing.

use std::sync::Arc;

use zeroize::Zeroizing;

use crate::crypto::{SessionKey, TAG_SIZE};
use crate::error::{Error, Result, Status};

use super::format::{stream_nonce, NonceKind, NONCE_PREFIX_SIZE};

const ZSTD_LEVEL: i32 = 3;

/// Segment sealer/opener bound to one content key.
pub(super) struct SegmentCipher {
    key: Arc<SessionKey>,
    prefix: [u8; NONCE_PREFIX_SIZE],
    counter: u32,
    finished: bool,
}

impl SegmentCipher {
    pub(super) fn new(key: Arc<SessionKey>, prefix: [u8; NONCE_PREFIX_SIZE]) -> Self {
        Self {
            key,
            prefix,
            counter: 0,
            finished: false,
        }
    }

    fn next_nonce(&mut self, last: bool) -> Result<[u8; 12]> {
        if self.finished {
            return Err(Error::with_detail(Status::BadData, "segment after final segment"));
        }
        let kind = if last {
            NonceKind::FinalSegment
        } else {
            NonceKind::Segment
        };
        let nonce = stream_nonce(&self.prefix, self.counter, kind);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| Error::with_detail(Status::BadData, "segment counter exhausted"))?;
        self.finished = last;
        Ok(nonce)
    }

    pub(super) fn seal(&mut self, plain: &[u8], last: bool) -> Result<Vec<u8>> {
        let nonce = self.next_nonce(last)?;
        self.key.seal(&nonce, &[], plain)
    }

    pub(super) fn open(&mut self, sealed: &[u8], last: bool) -> Result<Zeroizing<Vec<u8>>> {
        let nonce = self.next_nonce(last)?;
        self.key
            .open(&nonce, &[], sealed)
            .map_err(|_| Error::with_detail(Status::Signature, "segment failed authentication"))
    }

    pub(super) fn seal_inner_type(&self, content: u8) -> Result<Vec<u8>> {
        let nonce = stream_nonce(&self.prefix, u32::MAX, NonceKind::InnerType);
        self.key.seal(&nonce, &[], &[content])
    }

    pub(super) fn open_inner_type(&self, sealed: &[u8]) -> Result<u8> {
        let nonce = stream_nonce(&self.prefix, u32::MAX, NonceKind::InnerType);
        let plain = self
            .key
            .open(&nonce, &[], sealed)
            .map_err(|_| Error::with_detail(Status::Signature, "content type failed authentication"))?;
        match plain.as_slice() {
            [content] => Ok(*content),
            _ => Err(Error::with_detail(Status::BadData, "malformed content type")),
        }
    }
}

/// Compression and encryption applied to each segment.
pub(super) struct SegmentCodec {
    pub(super) cipher: Option<SegmentCipher>,
    pub(super) compress: bool,
    pub(super) segment_size: usize,
}

impl SegmentCodec {
    /// Bytes added by sealing.
    pub(super) fn overhead(&self) -> usize {
        if self.cipher.is_some() {
            TAG_SIZE
        } else {
            0
        }
    }

    /// Compress if enabled. Stateless, so a segment that does not fit the
    /// output can be re-prepared later.
    pub(super) fn prepare(&self, plain: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if !self.compress {
            return Ok(Zeroizing::new(plain.to_vec()));
        }
        zstd::bulk::compress(plain, ZSTD_LEVEL)
            .map(Zeroizing::new)
            .map_err(|_| Error::with_detail(Status::Memory, "compression failed"))
    }

    /// Seal a prepared segment. Advances the nonce counter.
    pub(super) fn seal(&mut self, prepared: Zeroizing<Vec<u8>>, last: bool) -> Result<Zeroizing<Vec<u8>>> {
        match &mut self.cipher {
            Some(cipher) => cipher.seal(&prepared, last).map(Zeroizing::new),
            None => Ok(prepared),
        }
    }

    /// Open and decompress one wire segment.
    pub(super) fn open(&mut self, wire: &[u8], last: bool) -> Result<Zeroizing<Vec<u8>>> {
        let opened = match &mut self.cipher {
            Some(cipher) => cipher.open(wire, last)?,
            None => Zeroizing::new(wire.to_vec()),
        };
        if !self.compress {
            return Ok(opened);
        }
        zstd::bulk::decompress(&opened, self.segment_size)
            .map(Zeroizing::new)
            .map_err(|_| Error::with_detail(Status::BadData, "segment does not decompress"))
    }

    /// Largest plaintext one wire segment can expand to.
    pub(super) fn max_plain(&self, wire_len: usize) -> usize {
        if self.compress {
            self.segment_size
        } else {
            wire_len.saturating_sub(self.overhead())
        }
    }
}
