//! Primitive context handles.
//!
//! These wrap the RustCrypto/dalek primitives behind the small surface the
//! engine consumes: seal/open, sign/verify, key agreement and password key
//! derivation. Handles are immutable once built and are shared between
//! objects through `Arc`. Secret material is zeroized on drop.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::error::{Error, Result, Status};

/// Symmetric key size in bytes.
pub const KEY_SIZE: usize = 32;
/// AEAD tag size in bytes.
pub const TAG_SIZE: usize = 16;
/// AEAD nonce size in bytes.
pub const NONCE_SIZE: usize = 12;
/// Key identifier size in bytes.
pub const KEY_ID_SIZE: usize = 8;
/// Content hash size (SHA-256).
pub const HASH_SIZE: usize = 32;
/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;
/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Password salt size.
pub const SALT_SIZE: usize = 16;
/// Most PBKDF2 iterations a password recipient may ask for.
pub const MAX_KDF_ITERATIONS: u32 = 10_000_000;
/// Size of a content key sealed under a key-encryption key.
pub const WRAPPED_KEY_SIZE: usize = KEY_SIZE + TAG_SIZE;

/// Short identifier derived from a key, used to match candidates.
pub type KeyId = [u8; KEY_ID_SIZE];

/// Pseudo-random function used for password key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Prf {
    /// PBKDF2 with HMAC-SHA-256.
    HmacSha256 = 1,
    /// PBKDF2 with HMAC-SHA-512.
    HmacSha512 = 2,
}

impl Prf {
    /// Parse from the wire byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::HmacSha256),
            2 => Ok(Self::HmacSha512),
            _ => Err(Error::with_detail(Status::BadData, "unknown prf")),
        }
    }

    /// Wire byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Derive a key-encryption key from a password.
pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    prf: Prf,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if iterations == 0 || iterations > MAX_KDF_ITERATIONS || password.is_empty() {
        return Err(Error::with_detail(Status::BadParam, "invalid key derivation input"));
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    match prf {
        Prf::HmacSha256 => pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key[..]),
        Prf::HmacSha512 => pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut key[..]),
    }
    Ok(key)
}

/// Fill a fresh random array.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    Sha256::digest(data).into()
}

fn truncated_id(data: &[u8]) -> KeyId {
    let digest = sha256(data);
    let mut id = [0u8; KEY_ID_SIZE];
    id.copy_from_slice(&digest[..KEY_ID_SIZE]);
    id
}

fn aead_seal(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| Error::with_detail(Status::Memory, "aead seal failed"))
}

fn aead_open(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    msg: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .map(Zeroizing::new)
        .map_err(|_| Error::new(Status::Signature))
}

/// Symmetric content key.
pub struct SessionKey {
    bytes: Zeroizing<[u8; KEY_SIZE]>,
}

impl SessionKey {
    /// Generate a random key.
    pub fn generate() -> Self {
        Self {
            bytes: Zeroizing::new(random_bytes()),
        }
    }

    /// Build from raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::with_detail(Status::BadData, "content key has wrong length"));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self::from_bytes(key))
    }

    /// Keyed identifier. Reveals nothing about the key beyond equality.
    pub fn key_id(&self) -> KeyId {
        // HMAC accepts keys of any length.
        let mut mac = match <Hmac<Sha256> as Mac>::new_from_slice(&self.bytes[..]) {
            Ok(mac) => mac,
            Err(_) => return [0u8; KEY_ID_SIZE],
        };
        mac.update(b"sealwire key id");
        let tag = mac.finalize().into_bytes();
        let mut id = [0u8; KEY_ID_SIZE];
        id.copy_from_slice(&tag[..KEY_ID_SIZE]);
        id
    }

    /// AEAD-encrypt `msg`.
    pub fn seal(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
        aead_seal(&self.bytes, nonce, aad, msg)
    }

    /// AEAD-decrypt `msg`. Fails with `Signature` if the tag does not verify.
    pub fn open(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], msg: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        aead_open(&self.bytes, nonce, aad, msg)
    }

    /// Seal this key under a key-encryption key.
    pub(crate) fn wrap_under(&self, kek: &[u8; KEY_SIZE], aad: &[u8]) -> Result<Vec<u8>> {
        aead_seal(kek, &[0u8; NONCE_SIZE], aad, &self.bytes[..])
    }

    /// Recover a key sealed with [`SessionKey::wrap_under`]. A tag failure
    /// means the key-encryption key was wrong.
    pub(crate) fn unwrap_under(kek: &[u8; KEY_SIZE], aad: &[u8], wrapped: &[u8]) -> Result<Self> {
        let plain = aead_open(kek, &[0u8; NONCE_SIZE], aad, wrapped).map_err(|_| Error::new(Status::WrongKey))?;
        Self::from_slice(&plain)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("key_id", &hex::encode(self.key_id()))
            .finish()
    }
}

/// X25519 public key of an envelope recipient or session peer.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: x25519_dalek::PublicKey,
}

impl PublicKey {
    /// Build from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self {
            inner: x25519_dalek::PublicKey::from(bytes),
        }
    }

    /// Raw bytes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.inner.to_bytes()
    }

    /// Identifier used in recipient records.
    pub fn key_id(&self) -> KeyId {
        truncated_id(self.inner.as_bytes())
    }

    /// Seal `cek` for this recipient with an ephemeral key agreement.
    ///
    /// Returns the ephemeral public key and the wrapped content key.
    pub(crate) fn wrap_key(&self, cek: &SessionKey, aad: &[u8]) -> Result<([u8; PUBLIC_KEY_SIZE], Vec<u8>)> {
        let ephemeral = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&self.inner);
        let kek = recipient_kek(shared.as_bytes(), ephemeral_public.as_bytes(), self.inner.as_bytes())?;
        let wrapped = cek.wrap_under(&kek, aad)?;
        Ok((ephemeral_public.to_bytes(), wrapped))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("key_id", &hex::encode(self.key_id()))
            .finish()
    }
}

fn recipient_kek(shared: &[u8], ephemeral: &[u8], recipient: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let mut salt = [0u8; PUBLIC_KEY_SIZE * 2];
    salt[..PUBLIC_KEY_SIZE].copy_from_slice(ephemeral);
    salt[PUBLIC_KEY_SIZE..].copy_from_slice(recipient);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut kek = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(b"sealwire recipient kek", &mut kek[..])
        .map_err(|_| Error::with_detail(Status::BadParam, "hkdf output length"))?;
    Ok(kek)
}

/// X25519 private key. Decrypts recipient records and serves as a
/// session's static Noise key.
pub struct PrivateKey {
    secret: x25519_dalek::StaticSecret,
    public: PublicKey,
}

impl PrivateKey {
    /// Generate a random key.
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        Self::from_secret(secret)
    }

    /// Build from raw secret bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self::from_secret(x25519_dalek::StaticSecret::from(bytes))
    }

    fn from_secret(secret: x25519_dalek::StaticSecret) -> Self {
        let public = PublicKey {
            inner: x25519_dalek::PublicKey::from(&secret),
        };
        Self { secret, public }
    }

    /// Matching public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Identifier of the public half.
    pub fn key_id(&self) -> KeyId {
        self.public.key_id()
    }

    /// Raw secret bytes, for handing to the Noise layer.
    pub(crate) fn secret_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Recover a content key wrapped by [`PublicKey::wrap_key`].
    pub(crate) fn unwrap_key(
        &self,
        ephemeral: &[u8; PUBLIC_KEY_SIZE],
        wrapped: &[u8],
        aad: &[u8],
    ) -> Result<SessionKey> {
        let ephemeral_public = x25519_dalek::PublicKey::from(*ephemeral);
        let shared = self.secret.diffie_hellman(&ephemeral_public);
        let kek = recipient_kek(shared.as_bytes(), ephemeral, self.public.inner.as_bytes())?;
        SessionKey::unwrap_under(&kek, aad, wrapped)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("key_id", &hex::encode(self.key_id()))
            .finish()
    }
}

/// Ed25519 signing key.
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Generate a random key.
    pub fn generate() -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Build from a 32-byte seed.
    pub fn from_bytes(seed: [u8; KEY_SIZE]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    /// Matching verification key.
    pub fn verify_key(&self) -> VerifyKey {
        VerifyKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Identifier of the verification half.
    pub fn key_id(&self) -> KeyId {
        self.verify_key().key_id()
    }

    /// Sign a content hash.
    pub fn sign(&self, hash: &[u8; HASH_SIZE]) -> [u8; SIGNATURE_SIZE] {
        self.inner.sign(hash).to_bytes()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &hex::encode(self.key_id()))
            .finish()
    }
}

/// Ed25519 verification key.
#[derive(Clone, PartialEq, Eq)]
pub struct VerifyKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl VerifyKey {
    /// Build from raw bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map(|inner| Self { inner })
            .map_err(|_| Error::with_detail(Status::BadParam, "invalid verification key"))
    }

    /// Identifier carried in signer records.
    pub fn key_id(&self) -> KeyId {
        truncated_id(self.inner.as_bytes())
    }

    /// Verify a signature over a content hash.
    pub fn verify(&self, hash: &[u8; HASH_SIZE], signature: &[u8; SIGNATURE_SIZE]) -> Result<()> {
        let signature = Signature::from_bytes(signature);
        self.inner
            .verify_strict(hash, &signature)
            .map_err(|_| Error::with_detail(Status::Signature, "signature does not verify"))
    }
}

impl fmt::Debug for VerifyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyKey")
            .field("key_id", &hex::encode(self.key_id()))
            .finish()
    }
}
