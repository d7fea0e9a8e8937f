//! Session record framing.
//!
//! Wire format:
//! ```text
//! +----------------+------------------+
//! | LENGTH (2B BE) | BODY (N bytes)   |
//! +----------------+------------------+
//! ```
//!
//! Body format:
//! ```text
//! +----------+-------------------+
//! | TYPE (1B)| PAYLOAD (N-1 B)   |
//! +----------+-------------------+
//! ```
//!
//! Hello and Handshake payloads travel in the clear (Noise protects the
//! handshake messages itself). AuthRequest, AuthResponse and Data payloads
//! are Noise transport ciphertexts.

use zeroize::Zeroizing;

use crate::error::{Error, Result, Status};
use crate::stream::StreamBuffer;

/// Maximum record body length (type byte + payload).
pub const MAX_WIRE_LENGTH: usize = 8192;

/// Maximum application plaintext carried by one Data record.
pub const MAX_PLAINTEXT_LENGTH: usize = 8000;

/// Length prefix size.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest complete record on the wire.
pub const MAX_RECORD_SIZE: usize = LENGTH_PREFIX_SIZE + MAX_WIRE_LENGTH;

/// Record type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Version and suite offer or answer.
    Hello = 0x01,
    /// Noise handshake message.
    Handshake = 0x02,
    /// Encrypted login.
    AuthRequest = 0x03,
    /// Encrypted login decision.
    AuthResponse = 0x04,
    /// Encrypted application data.
    Data = 0x05,
    /// Orderly shutdown.
    Close = 0x06,
}

impl RecordType {
    /// Parse from byte. Unknown types are malformed input.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Handshake),
            0x03 => Ok(Self::AuthRequest),
            0x04 => Ok(Self::AuthResponse),
            0x05 => Ok(Self::Data),
            0x06 => Ok(Self::Close),
            _ => Err(Error::with_detail(Status::BadData, "unknown record type")),
        }
    }
}

/// A validated record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    kind: RecordType,
    payload: Zeroizing<Vec<u8>>,
}

impl Record {
    /// Build a record, checking the size bound.
    pub fn new(kind: RecordType, payload: Vec<u8>) -> Result<Self> {
        if payload.len() + 1 > MAX_WIRE_LENGTH {
            return Err(Error::with_detail(Status::BadParam, "record too large"));
        }
        if kind == RecordType::Close && !payload.is_empty() {
            return Err(Error::with_detail(Status::BadParam, "close record carries no payload"));
        }
        Ok(Self {
            kind,
            payload: Zeroizing::new(payload),
        })
    }

    /// An empty Close record.
    pub fn close() -> Self {
        Self {
            kind: RecordType::Close,
            payload: Zeroizing::new(Vec::new()),
        }
    }

    /// Parse a record body (length prefix already removed).
    pub fn parse(body: &[u8]) -> Result<Self> {
        let Some((&kind, payload)) = body.split_first() else {
            return Err(Error::with_detail(Status::BadData, "empty record"));
        };
        if body.len() > MAX_WIRE_LENGTH {
            return Err(Error::with_detail(Status::BadData, "record too large"));
        }
        let kind = RecordType::from_byte(kind)?;
        if kind == RecordType::Close && !payload.is_empty() {
            return Err(Error::with_detail(Status::BadData, "close record carries a payload"));
        }
        Ok(Self {
            kind,
            payload: Zeroizing::new(payload.to_vec()),
        })
    }

    /// Body length from a length prefix.
    pub fn read_length(bytes: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize> {
        let length = usize::from(u16::from_be_bytes(bytes));
        if length == 0 {
            return Err(Error::with_detail(Status::BadData, "empty record"));
        }
        if length > MAX_WIRE_LENGTH {
            return Err(Error::with_detail(Status::BadData, "record too large"));
        }
        Ok(length)
    }

    /// Record type.
    pub fn kind(&self) -> RecordType {
        self.kind
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize with the length prefix.
    pub fn to_wire(&self) -> Vec<u8> {
        let body_len = 1 + self.payload.len();
        let mut wire = Vec::with_capacity(LENGTH_PREFIX_SIZE + body_len);
        // body_len <= MAX_WIRE_LENGTH, which fits in u16
        #[allow(clippy::cast_possible_truncation)]
        let len_bytes = (body_len as u16).to_be_bytes();
        wire.extend_from_slice(&len_bytes);
        wire.push(self.kind as u8);
        wire.extend_from_slice(&self.payload);
        wire
    }
}

/// Whether `input` holds a complete record, or a length prefix that
/// `take_record` will reject without reading more.
pub(crate) fn record_ready(input: &StreamBuffer) -> bool {
    let buffered = input.peek();
    if buffered.len() < LENGTH_PREFIX_SIZE {
        return false;
    }
    match Record::read_length([buffered[0], buffered[1]]) {
        Ok(length) => buffered.len() >= LENGTH_PREFIX_SIZE + length,
        Err(_) => true,
    }
}

/// Pull one complete record out of `input`, if buffered.
pub(crate) fn take_record(input: &mut StreamBuffer) -> Result<Option<Record>> {
    let buffered = input.peek();
    if buffered.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }
    let length = Record::read_length([buffered[0], buffered[1]])?;
    if buffered.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }
    let record = Record::parse(&buffered[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + length])?;
    input.consume(LENGTH_PREFIX_SIZE + length);
    Ok(Some(record))
}
