//! Typed object attributes.
//!
//! Attributes are the only way to configure an object or hand it a
//! credential. Every setter validates the value here before the object's
//! state is touched, so a rejected value never leaves a partial update.

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::credential::CredentialLookup;
use crate::crypto::{
    PrivateKey, PublicKey, SessionKey, SigningKey, VerifyKey, HASH_SIZE, MAX_KDF_ITERATIONS,
};
use crate::error::{Error, Result, Status};
use crate::registry::{MAX_VERSION, MIN_VERSION};

/// Smallest accepted I/O buffer.
pub const MIN_BUFFER_SIZE: i64 = 4096;
/// Largest accepted I/O buffer.
pub const MAX_BUFFER_SIZE: i64 = 32 * 1024 * 1024;
/// Longest accepted username.
pub const MAX_USERNAME_LEN: usize = 255;
/// Longest accepted password.
pub const MAX_PASSWORD_LEN: usize = 4096;

/// Attribute identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Capacity of each internal I/O buffer, in bytes.
    BufferSize,
    /// Declared total payload length; enables definite-length framing.
    DataSize,
    /// Plaintext bytes per segment.
    SegmentSize,
    /// PBKDF2 iterations for new password recipients.
    KdfIterations,
    /// PRF for new password recipients (see [`Prf`](crate::crypto::Prf)).
    Prf,
    /// Compress the payload (0 or 1).
    Compression,
    /// Produce or expect a detached signature (0 or 1).
    DetachedSignature,
    /// Content type of the payload (see [`ContentType`]).
    ContentType,
    /// Protocol version: the maximum offered before activation, the
    /// negotiated one after.
    Version,
    /// Failed logins a server accepts before ending the session.
    AuthRetryLimit,
    /// Transport read deadline in milliseconds.
    ReadTimeout,
    /// Transport write deadline in milliseconds.
    WriteTimeout,
    /// Server decision on a pending login: 1 approves, 0 denies.
    AuthResponse,
    /// Writing 1 activates a session; reads 1 once established.
    Active,
    /// Server asks the caller to decide each login (0 or 1).
    ManualAuth,
    /// Read-only index of the next candidate an attempt is charged to.
    CurrentCandidate,
    /// Login name.
    Username,
    /// Password recipient, decryption password or login password.
    Password,
    /// Read-only hex fingerprint of the peer's static key.
    Fingerprint,
    /// Read-only identity approved by the server.
    PeerIdentity,
    /// Read-only extended description of the last error.
    ErrorMessage,
    /// Private key handle.
    PrivateKey,
    /// Recipient public key handle.
    PublicKey,
    /// Signing key handle.
    SigningKey,
    /// Verification key handle.
    SignatureCheckKey,
    /// Pre-shared content key handle.
    SessionKey,
    /// Keyset consulted before suspending.
    Keyset,
    /// Content hash of a detached signature.
    DetachedHash,
}

/// Value class of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeClass {
    /// Integer.
    Numeric,
    /// UTF-8 text.
    Text,
    /// Object handle.
    Handle,
}

/// Payload content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    /// Opaque application data.
    Data = 1,
    /// A nested envelope.
    Envelope = 2,
}

impl ContentType {
    /// Parse from the wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Data),
            2 => Some(Self::Envelope),
            _ => None,
        }
    }
}

/// Handle-valued attribute payloads.
#[derive(Clone)]
pub enum Handle {
    /// Private key.
    PrivateKey(Arc<PrivateKey>),
    /// Public key.
    PublicKey(Arc<PublicKey>),
    /// Signing key.
    SigningKey(Arc<SigningKey>),
    /// Verification key.
    VerifyKey(Arc<VerifyKey>),
    /// Content key.
    SessionKey(Arc<SessionKey>),
    /// Credential source.
    Keyset(Arc<dyn CredentialLookup>),
    /// Content hash.
    Hash([u8; HASH_SIZE]),
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivateKey(key) => fmt::Debug::fmt(key, f),
            Self::PublicKey(key) => fmt::Debug::fmt(key, f),
            Self::SigningKey(key) => fmt::Debug::fmt(key, f),
            Self::VerifyKey(key) => fmt::Debug::fmt(key, f),
            Self::SessionKey(key) => fmt::Debug::fmt(key, f),
            Self::Keyset(_) => f.write_str("Keyset(..)"),
            Self::Hash(hash) => write!(f, "Hash({})", hex::encode(hash)),
        }
    }
}

fn bad(detail: &str) -> Error {
    Error::with_detail(Status::BadParam, detail)
}

impl Attribute {
    /// Value class.
    pub fn class(self) -> AttributeClass {
        match self {
            Self::Username
            | Self::Password
            | Self::Fingerprint
            | Self::PeerIdentity
            | Self::ErrorMessage => AttributeClass::Text,
            Self::PrivateKey
            | Self::PublicKey
            | Self::SigningKey
            | Self::SignatureCheckKey
            | Self::SessionKey
            | Self::Keyset
            | Self::DetachedHash => AttributeClass::Handle,
            _ => AttributeClass::Numeric,
        }
    }

    /// Whether callers may only read this attribute.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Self::CurrentCandidate | Self::Fingerprint | Self::PeerIdentity | Self::ErrorMessage
        )
    }

    /// Accepted range for numeric attributes.
    pub fn numeric_range(self) -> Option<RangeInclusive<i64>> {
        let range = match self {
            Self::BufferSize => MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE,
            Self::DataSize => 0..=i64::MAX,
            Self::SegmentSize => 256..=1024 * 1024,
            Self::KdfIterations => 1..=i64::from(MAX_KDF_ITERATIONS),
            Self::Prf => 1..=2,
            Self::ContentType => 1..=2,
            Self::Version => i64::from(MIN_VERSION)..=i64::from(MAX_VERSION),
            Self::AuthRetryLimit => 1..=100,
            Self::ReadTimeout | Self::WriteTimeout => 0..=3_600_000,
            Self::Compression
            | Self::DetachedSignature
            | Self::AuthResponse
            | Self::Active
            | Self::ManualAuth => 0..=1,
            _ => return None,
        };
        Some(range)
    }

    /// Check a numeric value before it is applied.
    pub fn validate_numeric(self, value: i64) -> Result<()> {
        if self.is_read_only() {
            return Err(bad("attribute is read-only"));
        }
        match self.numeric_range() {
            Some(range) if range.contains(&value) => Ok(()),
            Some(_) => Err(bad("numeric attribute out of range")),
            None => Err(bad("attribute is not numeric")),
        }
    }

    /// Check a text value before it is applied.
    pub fn validate_text(self, value: &str) -> Result<()> {
        let max = match self {
            Self::Username => MAX_USERNAME_LEN,
            Self::Password => MAX_PASSWORD_LEN,
            _ if self.is_read_only() => return Err(bad("attribute is read-only")),
            _ => return Err(bad("attribute is not text")),
        };
        if value.is_empty() || value.len() > max {
            return Err(bad("text attribute length out of range"));
        }
        Ok(())
    }

    /// Check that `handle` is the right kind for this attribute.
    pub fn validate_handle(self, handle: &Handle) -> Result<()> {
        let fits = matches!(
            (self, handle),
            (Self::PrivateKey, Handle::PrivateKey(_))
                | (Self::PublicKey, Handle::PublicKey(_))
                | (Self::SigningKey, Handle::SigningKey(_))
                | (Self::SignatureCheckKey, Handle::VerifyKey(_))
                | (Self::SessionKey, Handle::SessionKey(_))
                | (Self::Keyset, Handle::Keyset(_))
                | (Self::DetachedHash, Handle::Hash(_))
        );
        if fits {
            Ok(())
        } else {
            Err(bad("handle does not match attribute"))
        }
    }
}
