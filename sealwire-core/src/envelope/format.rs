//! Envelope wire format.
//!
//! ```text
//! +-------+---------+---------+-------+---------+
//! | MAGIC | VERSION | CONTENT | FLAGS | RECORDS |   header, 8 bytes
//! | 4B    | 1B      | 1B      | 1B    | 1B      |
//! +-------+---------+---------+-------+---------+
//! | TAG 1B | LEN 2B BE | VALUE ...              |   × RECORDS
//! +--------+-----------+------------------------+
//! | BODY TAG | body                             |
//! +----------+----------------------------------+
//! | trailer records (inner type, signature)     |
//! +---------------------------------------------+
//! ```
//!
//! Bodies are definite (`0xB0`, u64 length, raw bytes), segmented (`0xB1`,
//! u64 segment headers with the top bit marking the final segment, closed
//! by a zero header) or absent (`0xB2`, detached signatures).

use crate::crypto::{
    KeyId, Prf, HASH_SIZE, KEY_ID_SIZE, MAX_KDF_ITERATIONS, NONCE_SIZE, PUBLIC_KEY_SIZE, SALT_SIZE,
    SIGNATURE_SIZE, TAG_SIZE, WRAPPED_KEY_SIZE,
};
use crate::error::{Error, Result, Status};

/// Envelope magic.
pub const MAGIC: [u8; 4] = *b"SLWE";
/// Fixed header size.
pub const HEADER_SIZE: usize = 8;
/// Format version written by this build.
pub const FORMAT_VERSION: u8 = 1;
/// Record tag plus length.
pub const RECORD_HEADER_SIZE: usize = 3;

/// Payload is encrypted.
pub const FLAG_ENCRYPTED: u8 = 0x01;
/// A signature trailer follows the body.
pub const FLAG_SIGNED: u8 = 0x02;
/// Segments are compressed.
pub const FLAG_COMPRESSED: u8 = 0x04;
/// The signed content is carried elsewhere.
pub const FLAG_DETACHED: u8 = 0x08;
const KNOWN_FLAGS: u8 = FLAG_ENCRYPTED | FLAG_SIGNED | FLAG_COMPRESSED | FLAG_DETACHED;

/// Content byte of an encrypted envelope; the real type is in the trailer.
pub const CONTENT_OPAQUE: u8 = 0;

/// Definite-length body.
pub const BODY_DEFINITE: u8 = 0xB0;
/// Segmented body.
pub const BODY_SEGMENTED: u8 = 0xB1;
/// No body.
pub const BODY_NONE: u8 = 0xB2;
/// Length field of a definite body.
pub const BODY_LENGTH_SIZE: usize = 8;
/// Segment header size.
pub const SEGMENT_HEADER_SIZE: usize = 8;
/// Final-segment marker bit in a segment header.
pub const FINAL_SEGMENT: u64 = 1 << 63;

/// Content cipher identifier: ChaCha20-Poly1305 STREAM.
pub const CIPHER_CHACHA20_POLY1305: u8 = 1;
/// Nonce prefix length; the rest of the nonce is a counter and a flag.
pub const NONCE_PREFIX_SIZE: usize = 7;
/// Signed hash identifier: SHA-256.
pub const HASH_SHA256: u8 = 1;

/// Length of a password recipient record value.
pub const PASSWORD_RECORD_LEN: usize = 1 + 4 + SALT_SIZE + WRAPPED_KEY_SIZE;
/// Length of a public-key recipient record value.
pub const PUBKEY_RECORD_LEN: usize = KEY_ID_SIZE + PUBLIC_KEY_SIZE + WRAPPED_KEY_SIZE;
/// Length of the sealed inner content type.
pub const INNER_TYPE_LEN: usize = 1 + TAG_SIZE;

/// Record tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordTag {
    /// Content key wrapped under a password.
    Password = 0x10,
    /// Content key wrapped for a public key.
    PublicKey = 0x11,
    /// Content key is a pre-shared key.
    SessionKey = 0x12,
    /// Signer identity.
    Signer = 0x20,
    /// Compression algorithm.
    Compression = 0x30,
    /// Plaintext segment size.
    Segment = 0x40,
    /// Content cipher parameters.
    Cipher = 0x41,
    /// Signature trailer.
    Signature = 0xE0,
    /// Sealed content type trailer.
    InnerType = 0xE1,
}

impl RecordTag {
    /// Parse from the wire byte. Unknown tags are malformed input.
    pub fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            0x10 => Self::Password,
            0x11 => Self::PublicKey,
            0x12 => Self::SessionKey,
            0x20 => Self::Signer,
            0x30 => Self::Compression,
            0x40 => Self::Segment,
            0x41 => Self::Cipher,
            0xE0 => Self::Signature,
            0xE1 => Self::InnerType,
            _ => return Err(Error::with_detail(Status::BadData, "unknown record tag")),
        })
    }

    /// Additional data binding a wrapped key to its record kind.
    pub fn aad(self) -> [u8; 1] {
        [self as u8]
    }
}

/// Fixed envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Format version.
    pub version: u8,
    /// Content type byte, or [`CONTENT_OPAQUE`].
    pub content: u8,
    /// Flag bits.
    pub flags: u8,
    /// Number of records that follow.
    pub records: u8,
}

impl Header {
    /// Wire bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&MAGIC);
        out[4] = self.version;
        out[5] = self.content;
        out[6] = self.flags;
        out[7] = self.records;
        out
    }

    /// Parse and sanity-check a header.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        if bytes[..4] != MAGIC {
            return Err(Error::with_detail(Status::BadData, "not an envelope"));
        }
        let header = Self {
            version: bytes[4],
            content: bytes[5],
            flags: bytes[6],
            records: bytes[7],
        };
        if header.flags & !KNOWN_FLAGS != 0 {
            return Err(Error::with_detail(Status::BadData, "unknown envelope flags"));
        }
        if header.has(FLAG_DETACHED) && !header.has(FLAG_SIGNED) {
            return Err(Error::with_detail(Status::BadData, "detached flag without signature"));
        }
        Ok(header)
    }

    /// Whether `flag` is set.
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Encode one tag-length-value record.
pub fn encode_record(tag: RecordTag, value: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(value.len())
        .map_err(|_| Error::with_detail(Status::BadParam, "record too long"))?;
    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + value.len());
    out.push(tag as u8);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value);
    Ok(out)
}

/// Split a record header into tag byte and value length.
pub fn record_header(bytes: &[u8]) -> (u8, usize) {
    (bytes[0], usize::from(u16::from_be_bytes([bytes[1], bytes[2]])))
}

fn expect_len(value: &[u8], len: usize, what: &str) -> Result<()> {
    if value.len() != len {
        return Err(Error::with_detail(Status::BadData, format!("{what} record has wrong length")));
    }
    Ok(())
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Password recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordRecord {
    /// Key derivation PRF.
    pub prf: Prf,
    /// PBKDF2 iterations.
    pub iterations: u32,
    /// Salt.
    pub salt: [u8; SALT_SIZE],
    /// Sealed content key.
    pub wrapped: [u8; WRAPPED_KEY_SIZE],
}

impl PasswordRecord {
    /// Record value bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PASSWORD_RECORD_LEN);
        out.push(self.prf.to_byte());
        out.extend_from_slice(&self.iterations.to_be_bytes());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.wrapped);
        out
    }

    /// Parse a record value.
    pub fn decode(value: &[u8]) -> Result<Self> {
        expect_len(value, PASSWORD_RECORD_LEN, "password")?;
        let iterations = u32::from_be_bytes(array(&value[1..5]));
        if iterations == 0 || iterations > MAX_KDF_ITERATIONS {
            return Err(Error::with_detail(Status::BadData, "kdf iteration count out of range"));
        }
        Ok(Self {
            prf: Prf::from_byte(value[0])?,
            iterations,
            salt: array(&value[5..5 + SALT_SIZE]),
            wrapped: array(&value[5 + SALT_SIZE..]),
        })
    }
}

/// Public-key recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyRecord {
    /// Recipient key id.
    pub key_id: KeyId,
    /// Sender's ephemeral public key.
    pub ephemeral: [u8; PUBLIC_KEY_SIZE],
    /// Sealed content key.
    pub wrapped: [u8; WRAPPED_KEY_SIZE],
}

impl PublicKeyRecord {
    /// Record value bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUBKEY_RECORD_LEN);
        out.extend_from_slice(&self.key_id);
        out.extend_from_slice(&self.ephemeral);
        out.extend_from_slice(&self.wrapped);
        out
    }

    /// Parse a record value.
    pub fn decode(value: &[u8]) -> Result<Self> {
        expect_len(value, PUBKEY_RECORD_LEN, "public key")?;
        Ok(Self {
            key_id: array(&value[..KEY_ID_SIZE]),
            ephemeral: array(&value[KEY_ID_SIZE..KEY_ID_SIZE + PUBLIC_KEY_SIZE]),
            wrapped: array(&value[KEY_ID_SIZE + PUBLIC_KEY_SIZE..]),
        })
    }
}

/// Parse a key-id-only record value (session key).
pub fn decode_key_id(value: &[u8]) -> Result<KeyId> {
    expect_len(value, KEY_ID_SIZE, "key id")?;
    Ok(array(value))
}

/// Parse a signer record value: key id and hash algorithm.
pub fn decode_signer(value: &[u8]) -> Result<KeyId> {
    expect_len(value, KEY_ID_SIZE + 1, "signer")?;
    if value[KEY_ID_SIZE] != HASH_SHA256 {
        return Err(Error::with_detail(Status::BadData, "unsupported signature hash"));
    }
    Ok(array(value))
}

/// Signer record value.
pub fn encode_signer(key_id: &KeyId) -> Vec<u8> {
    let mut out = key_id.to_vec();
    out.push(HASH_SHA256);
    out
}

/// Parse a cipher record value into the nonce prefix.
pub fn decode_cipher(value: &[u8]) -> Result<[u8; NONCE_PREFIX_SIZE]> {
    expect_len(value, 1 + NONCE_PREFIX_SIZE, "cipher")?;
    if value[0] != CIPHER_CHACHA20_POLY1305 {
        return Err(Error::with_detail(Status::BadData, "unsupported content cipher"));
    }
    Ok(array(&value[1..]))
}

/// Cipher record value.
pub fn encode_cipher(prefix: &[u8; NONCE_PREFIX_SIZE]) -> Vec<u8> {
    let mut out = vec![CIPHER_CHACHA20_POLY1305];
    out.extend_from_slice(prefix);
    out
}

/// Parse a segment-size record value.
pub fn decode_segment_size(value: &[u8]) -> Result<usize> {
    expect_len(value, 4, "segment")?;
    let size = u32::from_be_bytes(array(value)) as usize;
    if size == 0 {
        return Err(Error::with_detail(Status::BadData, "zero segment size"));
    }
    Ok(size)
}

/// Parse a signature trailer value.
pub fn decode_signature(value: &[u8]) -> Result<[u8; SIGNATURE_SIZE]> {
    expect_len(value, SIGNATURE_SIZE, "signature")?;
    Ok(array(value))
}

/// Parse a detached hash supplied as bytes.
pub fn decode_hash(value: &[u8]) -> Result<[u8; HASH_SIZE]> {
    expect_len(value, HASH_SIZE, "hash")?;
    Ok(array(value))
}

/// Role of a nonce within the content stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NonceKind {
    /// Any segment but the last.
    Segment = 0,
    /// The last segment.
    FinalSegment = 1,
    /// The sealed inner content type.
    InnerType = 2,
}

/// STREAM nonce: prefix, big-endian counter, role byte.
pub fn stream_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], counter: u32, kind: NonceKind) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..NONCE_PREFIX_SIZE + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[NONCE_SIZE - 1] = kind as u8;
    nonce
}

/// Segment header bytes.
pub fn segment_header(len: usize, last: bool) -> [u8; SEGMENT_HEADER_SIZE] {
    let mut value = len as u64;
    if last {
        value |= FINAL_SEGMENT;
    }
    value.to_be_bytes()
}

/// Split a segment header into length and final flag. A zero header is
/// the body terminator.
pub fn parse_segment_header(bytes: &[u8]) -> (u64, bool) {
    let value = u64::from_be_bytes(array(bytes));
    (value & !FINAL_SEGMENT, value & FINAL_SEGMENT != 0)
}

/// Encoded body length of an encrypted definite envelope.
pub fn sealed_body_len(plain: u64, segment_size: usize) -> u64 {
    let segment_size = segment_size as u64;
    let segments = if plain == 0 { 1 } else { plain.div_ceil(segment_size) };
    plain + segments * TAG_SIZE as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_rejects_bad_magic_and_flags() {
        let header = Header {
            version: FORMAT_VERSION,
            content: 1,
            flags: FLAG_SIGNED,
            records: 2,
        };
        let mut bytes = header.encode();
        assert_eq!(Header::decode(&bytes).unwrap(), header);
        bytes[6] = 0x80;
        assert_eq!(Header::decode(&bytes).unwrap_err().status(), Status::BadData);
        bytes[6] = FLAG_DETACHED;
        assert_eq!(Header::decode(&bytes).unwrap_err().status(), Status::BadData);
        bytes[0] = b'X';
        assert_eq!(Header::decode(&bytes).unwrap_err().status(), Status::BadData);
    }

    #[test]
    fn test_segment_header_final_bit() {
        let bytes = segment_header(4096, true);
        assert_eq!(parse_segment_header(&bytes), (4096, true));
        assert_eq!(parse_segment_header(&[0u8; 8]), (0, false));
    }

    #[test]
    fn test_stream_nonces_differ_by_role() {
        let prefix = [9u8; NONCE_PREFIX_SIZE];
        let a = stream_nonce(&prefix, 3, NonceKind::Segment);
        let b = stream_nonce(&prefix, 3, NonceKind::FinalSegment);
        assert_ne!(a, b);
        assert_eq!(&a[7..11], &3u32.to_be_bytes());
    }

    #[test]
    fn test_sealed_body_len() {
        assert_eq!(sealed_body_len(0, 4096), 16);
        assert_eq!(sealed_body_len(15, 4096), 31);
        assert_eq!(sealed_body_len(4096, 4096), 4112);
        assert_eq!(sealed_body_len(4097, 4096), 4097 + 32);
    }

    #[test]
    fn test_password_record_layout() {
        let record = PasswordRecord {
            prf: Prf::HmacSha512,
            iterations: 1000,
            salt: [1u8; SALT_SIZE],
            wrapped: [2u8; WRAPPED_KEY_SIZE],
        };
        let bytes = record.encode();
        assert_eq!(bytes.len(), PASSWORD_RECORD_LEN);
        assert_eq!(PasswordRecord::decode(&bytes).unwrap(), record);
        assert!(PasswordRecord::decode(&bytes[1..]).is_err());
    }

    #[test]
    fn test_password_record_iteration_bounds() {
        let mut record = PasswordRecord {
            prf: Prf::HmacSha256,
            iterations: MAX_KDF_ITERATIONS,
            salt: [3u8; SALT_SIZE],
            wrapped: [4u8; WRAPPED_KEY_SIZE],
        };
        assert!(PasswordRecord::decode(&record.encode()).is_ok());
        for iterations in [0, MAX_KDF_ITERATIONS + 1, 4_000_000_000] {
            record.iterations = iterations;
            let err = PasswordRecord::decode(&record.encode()).unwrap_err();
            assert_eq!(err.status(), Status::BadData);
        }
    }
}
