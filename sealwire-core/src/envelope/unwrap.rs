//! De-enveloping.
//!
//! Input is parsed incrementally from the input buffer: a phase only
//! advances once all of its bytes are buffered, so any chunking of the
//! pushed stream produces the same result. Key records are kept in a
//! [`ResourcePool`] until the content key is recovered.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::attribute::{ContentType, Handle};
use crate::credential::{Attempt, Credential, ResourceKind};
use crate::crypto::{self, KeyId, PrivateKey, SessionKey, HASH_SIZE, SIGNATURE_SIZE, TAG_SIZE};
use crate::error::{Error, Result, Status};
use crate::fault::FaultKind;
use crate::pool::{PoolBlock, ResourcePool};
use crate::registry::Compression;

use super::format::{
    decode_cipher, decode_key_id, decode_segment_size, decode_signature, decode_signer,
    parse_segment_header, record_header, Header, PasswordRecord, PublicKeyRecord, RecordTag,
    BODY_DEFINITE, BODY_LENGTH_SIZE, BODY_NONE, BODY_SEGMENTED, FLAG_COMPRESSED, FLAG_DETACHED,
    FLAG_ENCRYPTED, FLAG_SIGNED, HEADER_SIZE, NONCE_PREFIX_SIZE, RECORD_HEADER_SIZE,
    SEGMENT_HEADER_SIZE,
};
use super::segment::{SegmentCipher, SegmentCodec};
use super::{Core, EnvelopeState};

/// Scratch space for key records.
const RECORD_POOL_SIZE: usize = 1024;
/// Signed content is withheld until verified, up to this many buffers' worth.
const WITHHELD_BUFFERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Preamble,
    Records { left: u8 },
    Keys,
    BodyTag,
    Definite { remaining: u64 },
    SegmentHeader,
    Segment { len: usize, last: bool },
    Trailer,
    Verify,
    Done,
}

pub(super) struct Unwrapper {
    phase: Phase,
    header: Option<Header>,
    pool: ResourcePool,
    password_records: Vec<PoolBlock>,
    pubkey_records: Vec<PoolBlock>,
    session_key_id: Option<KeyId>,
    nonce_prefix: Option<[u8; NONCE_PREFIX_SIZE]>,
    segment_size: Option<usize>,
    compression: Option<Compression>,
    signer: Option<KeyId>,
    codec: Option<SegmentCodec>,
    hasher: Option<Sha256>,
    content_hash: Option<[u8; HASH_SIZE]>,
    withheld: Vec<Zeroizing<Vec<u8>>>,
    withheld_len: usize,
    signature: Option<[u8; SIGNATURE_SIZE]>,
    inner_type_read: bool,
    seen_final: bool,
    blocked: bool,
}

fn malformed(detail: &str) -> Error {
    Error::with_detail(Status::BadData, detail)
}

fn bad(detail: &str) -> Error {
    Error::with_detail(Status::BadParam, detail)
}

/// `n` buffered bytes, or `None` if more input is needed.
fn peek(core: &Core, n: usize) -> Option<&[u8]> {
    let buffered = core.input.peek();
    (buffered.len() >= n).then(|| &buffered[..n])
}

impl Unwrapper {
    pub(super) fn new() -> Result<Self> {
        Ok(Self {
            phase: Phase::Preamble,
            header: None,
            pool: ResourcePool::new(RECORD_POOL_SIZE)?,
            password_records: Vec::new(),
            pubkey_records: Vec::new(),
            session_key_id: None,
            nonce_prefix: None,
            segment_size: None,
            compression: None,
            signer: None,
            codec: None,
            hasher: None,
            content_hash: None,
            withheld: Vec::new(),
            withheld_len: 0,
            signature: None,
            inner_type_read: false,
            seen_final: false,
            blocked: false,
        })
    }

    pub(super) fn wipe(&mut self) {
        self.codec = None;
        self.hasher = None;
        self.withheld.clear();
        self.withheld_len = 0;
        self.password_records.clear();
        self.pubkey_records.clear();
    }

    pub(super) fn is_signed(&self) -> bool {
        self.has(FLAG_SIGNED)
    }

    fn has(&self, flag: u8) -> bool {
        self.header.map_or(false, |header| header.has(flag))
    }

    fn withholding(&self) -> bool {
        self.is_signed() && !self.has(FLAG_DETACHED)
    }

    // Header and records

    fn read_preamble(&mut self, core: &mut Core) -> Result<bool> {
        let Some(bytes) = peek(core, HEADER_SIZE) else {
            return Ok(false);
        };
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(bytes);
        let header = Header::decode(&raw)?;
        if !core.registry.supports_version(header.version) {
            return Err(malformed("unsupported envelope version"));
        }
        if usize::from(header.records) > core.settings.max_records {
            return Err(malformed("too many records"));
        }
        core.input.consume(HEADER_SIZE);
        core.state = EnvelopeState::HeaderParsing;
        self.header = Some(header);
        if header.has(FLAG_SIGNED) && !header.has(FLAG_DETACHED) {
            self.hasher = Some(Sha256::new());
        }
        self.phase = Phase::Records {
            left: header.records,
        };
        tracing::debug!(
            version = header.version,
            flags = header.flags,
            records = header.records,
            "envelope header parsed"
        );
        Ok(true)
    }

    fn read_record(&mut self, core: &mut Core, left: u8) -> Result<bool> {
        let Some(head) = peek(core, RECORD_HEADER_SIZE) else {
            return Ok(false);
        };
        let (tag, len) = record_header(head);
        let Some(record) = peek(core, RECORD_HEADER_SIZE + len) else {
            return Ok(false);
        };
        let value = &record[RECORD_HEADER_SIZE..];
        let tag = RecordTag::from_byte(tag)?;
        match tag {
            RecordTag::Password => {
                let parsed = PasswordRecord::decode(value)?;
                if !core.registry.supports_prf(parsed.prf) {
                    return Err(malformed("password prf not accepted"));
                }
                let block = self.pool.alloc_copy(value)?;
                self.password_records.push(block);
                core.exchange.add_candidate(ResourceKind::Password, None);
            }
            RecordTag::PublicKey => {
                let parsed = PublicKeyRecord::decode(value)?;
                let block = self.pool.alloc_copy(value)?;
                self.pubkey_records.push(block);
                core.exchange
                    .add_candidate(ResourceKind::PrivateKey, Some(parsed.key_id));
            }
            RecordTag::SessionKey => {
                let id = decode_key_id(value)?;
                if self.session_key_id.replace(id).is_some() {
                    return Err(malformed("duplicate session key record"));
                }
                core.exchange.add_candidate(ResourceKind::SessionKey, Some(id));
            }
            RecordTag::Signer => {
                if self.signer.replace(decode_signer(value)?).is_some() {
                    return Err(malformed("duplicate signer record"));
                }
            }
            RecordTag::Compression => {
                let algorithm = value
                    .first()
                    .and_then(|&b| Compression::from_byte(b))
                    .filter(|&a| core.registry.supports_compression(a))
                    .ok_or_else(|| malformed("unsupported compression"))?;
                self.compression = Some(algorithm);
            }
            RecordTag::Segment => {
                let size = decode_segment_size(value)?;
                if size * 2 > core.settings.buffer_size {
                    return Err(malformed("segment size exceeds buffer"));
                }
                self.segment_size = Some(size);
            }
            RecordTag::Cipher => self.nonce_prefix = Some(decode_cipher(value)?),
            RecordTag::Signature | RecordTag::InnerType => {
                return Err(malformed("trailer record in header"));
            }
        }
        core.input.consume(RECORD_HEADER_SIZE + len);
        self.phase = Phase::Records { left: left - 1 };
        Ok(true)
    }

    /// Cross-check the records against the header flags.
    fn check_records(&self) -> Result<()> {
        let encrypted = self.has(FLAG_ENCRYPTED);
        let has_keys = !self.password_records.is_empty()
            || !self.pubkey_records.is_empty()
            || self.session_key_id.is_some();
        if encrypted && (self.nonce_prefix.is_none() || self.segment_size.is_none() || !has_keys) {
            return Err(malformed("encrypted envelope without key records"));
        }
        if !encrypted && (has_keys || self.nonce_prefix.is_some()) {
            return Err(malformed("key records in unencrypted envelope"));
        }
        if self.has(FLAG_COMPRESSED) != self.compression.is_some() {
            return Err(malformed("compression flag and record disagree"));
        }
        if self.has(FLAG_COMPRESSED) && self.segment_size.is_none() {
            return Err(malformed("compressed envelope without segment size"));
        }
        if self.is_signed() != self.signer.is_some() {
            return Err(malformed("signature flag and signer record disagree"));
        }
        Ok(())
    }

    // Content key recovery

    fn try_password(&self, core: &Core, password: &[u8]) -> Result<Option<Arc<SessionKey>>> {
        for block in &self.password_records {
            let record = PasswordRecord::decode(self.pool.bytes(block)?)?;
            if !core.registry.supports_prf(record.prf) {
                continue;
            }
            let kek = crypto::derive_key(password, &record.salt, record.iterations, record.prf)?;
            match SessionKey::unwrap_under(&kek, &RecordTag::Password.aad(), &record.wrapped) {
                Ok(key) => return Ok(Some(Arc::new(key))),
                Err(err) if err.status() == Status::WrongKey => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn try_private_key(&self, key: &PrivateKey) -> Result<Option<Arc<SessionKey>>> {
        let id = key.key_id();
        for block in &self.pubkey_records {
            let record = PublicKeyRecord::decode(self.pool.bytes(block)?)?;
            if record.key_id != id {
                continue;
            }
            match key.unwrap_key(&record.ephemeral, &record.wrapped, &RecordTag::PublicKey.aad()) {
                Ok(cek) => return Ok(Some(Arc::new(cek))),
                Err(err) if err.status() == Status::WrongKey => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn pubkey_ids(&self) -> Result<Vec<KeyId>> {
        self.pubkey_records
            .iter()
            .map(|block| Ok(PublicKeyRecord::decode(self.pool.bytes(block)?)?.key_id))
            .collect()
    }

    /// Charge a failed attempt. Returns the error to surface.
    fn charge(core: &mut Core, kind: ResourceKind, key_id: Option<&KeyId>, what: &str) -> Error {
        match core.exchange.record_failure(kind, key_id) {
            Attempt::Retry => {
                if let Some(next) = core.exchange.next_kind() {
                    core.exchange.suspend(next);
                    core.state = EnvelopeState::SuspendedNeedsResource(next);
                }
                tracing::debug!(cursor = core.exchange.cursor(), "credential rejected");
                Error::with_detail(Status::WrongKey, format!("{what} did not match; try another"))
            }
            Attempt::Exhausted => core.fail(Error::with_detail(
                Status::WrongKey,
                format!("{what} did not match and no candidates remain"),
            )),
        }
    }

    /// Try every credential available without asking the caller.
    fn resolve(&mut self, core: &mut Core) -> Result<Option<Arc<SessionKey>>> {
        if let Some(id) = self.session_key_id {
            if let Some(key) = core.creds.session_key.take() {
                if key.key_id() == id {
                    return Ok(Some(key));
                }
                let err = Self::charge(core, ResourceKind::SessionKey, Some(&id), "session key");
                if core.fault.is_some() {
                    return Err(err);
                }
            }
            if let Some(keyset) = core.creds.keyset.clone() {
                match keyset.lookup(ResourceKind::SessionKey, &id) {
                    Ok(Credential::SessionKey(key)) if key.key_id() == id => return Ok(Some(key)),
                    Ok(_) => {}
                    Err(err) if err.status() == Status::NotFound => {}
                    Err(err) => return Err(err),
                }
            }
        }

        while let Some(password) = core.creds.passwords.pop_front() {
            if self.password_records.is_empty() {
                break;
            }
            if let Some(key) = self.try_password(core, password.as_bytes())? {
                return Ok(Some(key));
            }
            let err = Self::charge(core, ResourceKind::Password, None, "password");
            if core.fault.is_some() {
                return Err(err);
            }
        }

        if let Some(key) = core.creds.private_key.take() {
            if let Some(cek) = self.try_private_key(&key)? {
                return Ok(Some(cek));
            }
            let id = key.key_id();
            let err = Self::charge(core, ResourceKind::PrivateKey, Some(&id), "private key");
            if core.fault.is_some() {
                return Err(err);
            }
        }

        if let Some(keyset) = core.creds.keyset.clone() {
            for id in self.pubkey_ids()? {
                match keyset.lookup(ResourceKind::PrivateKey, &id) {
                    Ok(Credential::PrivateKey(key)) => {
                        if let Some(cek) = self.try_private_key(&key)? {
                            return Ok(Some(cek));
                        }
                    }
                    Ok(_) => {}
                    Err(err) if err.status() == Status::NotFound => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(None)
    }

    fn install(&mut self, core: &mut Core, key: Arc<SessionKey>) -> Result<()> {
        let prefix = self
            .nonce_prefix
            .ok_or_else(|| malformed("missing cipher record"))?;
        let segment_size = self
            .segment_size
            .ok_or_else(|| malformed("missing segment record"))?;
        self.codec = Some(SegmentCodec {
            cipher: Some(SegmentCipher::new(key, prefix)),
            compress: self.compression.is_some(),
            segment_size,
        });
        core.exchange.satisfy();
        core.state = EnvelopeState::BodyProcessing;
        self.phase = Phase::BodyTag;
        tracing::debug!("content key recovered");
        Ok(())
    }

    fn enter_keys(&mut self, core: &mut Core) -> Result<()> {
        self.check_records()?;
        if !self.has(FLAG_ENCRYPTED) {
            if self.has(FLAG_COMPRESSED) || !self.has(FLAG_DETACHED) {
                self.codec = Some(SegmentCodec {
                    cipher: None,
                    compress: self.compression.is_some(),
                    segment_size: self.segment_size.unwrap_or(core.settings.segment_size),
                });
            }
            core.state = EnvelopeState::BodyProcessing;
            self.phase = Phase::BodyTag;
            return Ok(());
        }
        match self.resolve(core)? {
            Some(key) => self.install(core, key),
            None => {
                let kind = core
                    .exchange
                    .next_kind()
                    .ok_or_else(|| core.fail(Error::with_detail(Status::WrongKey, "no candidates remain")))?;
                Err(core.suspend(kind))
            }
        }
    }

    // Credential supply

    pub(super) fn supply_password(&mut self, core: &mut Core, password: Zeroizing<String>) -> Result<()> {
        if matches!(self.phase, Phase::Preamble | Phase::Records { .. }) {
            core.creds.passwords.push_back(password);
            return Ok(());
        }
        if !core.is_suspended() || self.phase != Phase::Keys {
            return Err(bad("no password is needed now"));
        }
        if self.password_records.is_empty() {
            return Err(bad("envelope has no password recipients"));
        }
        match self.try_password(core, password.as_bytes())? {
            Some(key) => self.install(core, key),
            None => Err(Self::charge(core, ResourceKind::Password, None, "password")),
        }
    }

    pub(super) fn supply_handle(&mut self, core: &mut Core, handle: Handle) -> Result<()> {
        let awaiting_key = core.is_suspended() && self.phase == Phase::Keys;
        let awaiting_check = core.is_suspended() && self.phase == Phase::Verify;
        match handle {
            Handle::PrivateKey(key) => {
                if !awaiting_key {
                    core.creds.private_key = Some(key);
                    return Ok(());
                }
                match self.try_private_key(&key)? {
                    Some(cek) => self.install(core, cek),
                    None => {
                        let id = key.key_id();
                        Err(Self::charge(core, ResourceKind::PrivateKey, Some(&id), "private key"))
                    }
                }
            }
            Handle::SessionKey(key) => {
                if !awaiting_key {
                    core.creds.session_key = Some(key);
                    return Ok(());
                }
                match self.session_key_id {
                    Some(id) if key.key_id() == id => self.install(core, key),
                    Some(id) => Err(Self::charge(core, ResourceKind::SessionKey, Some(&id), "session key")),
                    None => Err(bad("envelope has no session key recipient")),
                }
            }
            Handle::Keyset(keyset) => {
                core.creds.keyset = Some(keyset);
                if awaiting_key {
                    return match self.resolve(core)? {
                        Some(key) => self.install(core, key),
                        None => Err(Error::with_detail(Status::NotFound, "keyset holds no matching key")),
                    };
                }
                if awaiting_check {
                    return self.verify(core);
                }
                Ok(())
            }
            Handle::VerifyKey(key) => {
                core.creds.check_key = Some(key);
                if awaiting_check {
                    return self.verify(core);
                }
                Ok(())
            }
            Handle::Hash(hash) => {
                core.creds.detached_hash = Some(hash);
                if awaiting_check {
                    return self.verify(core);
                }
                Ok(())
            }
            _ => Err(bad("handle does not apply when unwrapping")),
        }
    }

    // Body

    fn withheld_room(&self, core: &Core) -> usize {
        (core.settings.buffer_size * WITHHELD_BUFFERS).saturating_sub(self.withheld_len)
    }

    /// Whether `n` plaintext bytes can be delivered now. Sets `blocked`
    /// when the output buffer is the reason they cannot.
    fn has_room(&mut self, core: &Core, n: usize) -> Result<bool> {
        if self.withholding() {
            if self.withheld_room(core) < n {
                return Err(Error::with_detail(
                    Status::Memory,
                    "signed content exceeds the verification window",
                ));
            }
            return Ok(true);
        }
        if core.output.room() < n {
            self.blocked = true;
            return Ok(false);
        }
        Ok(true)
    }

    fn deliver(&mut self, core: &mut Core, plain: &[u8]) {
        if let Some(hasher) = &mut self.hasher {
            hasher.update(plain);
        }
        if self.withholding() {
            if !plain.is_empty() {
                self.withheld.push(Zeroizing::new(plain.to_vec()));
                self.withheld_len += plain.len();
            }
        } else {
            core.output.write_all(plain);
        }
    }

    fn corrupt_if_armed(core: &Core, bytes: &mut [u8]) {
        if !bytes.is_empty() && core.faults.trip(FaultKind::CorruptPayload) {
            bytes[0] ^= 0x01;
        }
    }

    fn read_body_tag(&mut self, core: &mut Core) -> Result<bool> {
        let Some(tag) = peek(core, 1).map(|b| b[0]) else {
            return Ok(false);
        };
        match tag {
            BODY_DEFINITE => {
                if self.has(FLAG_DETACHED) {
                    return Err(malformed("detached envelope carries a body"));
                }
                let Some(bytes) = peek(core, 1 + BODY_LENGTH_SIZE) else {
                    return Ok(false);
                };
                let mut len = [0u8; BODY_LENGTH_SIZE];
                len.copy_from_slice(&bytes[1..]);
                let remaining = u64::from_be_bytes(len);
                if self.has(FLAG_COMPRESSED) {
                    return Err(malformed("compressed envelope with definite body"));
                }
                core.input.consume(1 + BODY_LENGTH_SIZE);
                self.phase = Phase::Definite { remaining };
            }
            BODY_SEGMENTED => {
                if self.has(FLAG_DETACHED) {
                    return Err(malformed("detached envelope carries a body"));
                }
                core.input.consume(1);
                self.phase = Phase::SegmentHeader;
            }
            BODY_NONE => {
                if !self.has(FLAG_DETACHED) {
                    return Err(malformed("missing body"));
                }
                core.input.consume(1);
                self.phase = Phase::Trailer;
            }
            _ => return Err(malformed("unknown body type")),
        }
        Ok(true)
    }

    fn read_definite(&mut self, core: &mut Core, remaining: u64) -> Result<bool> {
        if remaining == 0 {
            if self.has(FLAG_ENCRYPTED) && !self.seen_final {
                return Err(malformed("body ended before its final segment"));
            }
            self.phase = Phase::Trailer;
            return Ok(true);
        }
        let remaining_usize = usize::try_from(remaining).unwrap_or(usize::MAX);
        let Some(codec) = self.codec.as_ref().filter(|codec| codec.cipher.is_some()) else {
            // Plain definite body: pass bytes through as they arrive.
            let available = core.input.len().min(remaining_usize);
            let room = if self.withholding() {
                self.withheld_room(core)
            } else {
                core.output.room()
            };
            let n = available.min(room);
            if n == 0 {
                if available > 0 {
                    self.has_room(core, available)?;
                }
                return Ok(false);
            }
            let mut chunk = Zeroizing::new(core.input.peek()[..n].to_vec());
            Self::corrupt_if_armed(core, &mut chunk);
            core.input.consume(n);
            self.deliver(core, &chunk);
            self.phase = Phase::Definite {
                remaining: remaining - n as u64,
            };
            return Ok(true);
        };

        if remaining_usize < TAG_SIZE {
            return Err(malformed("truncated sealed segment"));
        }
        let wire_len = (codec.segment_size + TAG_SIZE).min(remaining_usize);
        let last = wire_len == remaining_usize;
        if core.input.len() < wire_len {
            if core.input.room() == 0 {
                return Err(malformed("segment larger than the input buffer"));
            }
            return Ok(false);
        }
        if !self.has_room(core, wire_len - TAG_SIZE)? {
            return Ok(false);
        }
        let mut wire = Zeroizing::new(core.input.peek()[..wire_len].to_vec());
        Self::corrupt_if_armed(core, &mut wire);
        let plain = match self.codec.as_mut() {
            Some(codec) => codec.open(&wire, last)?,
            None => return Err(malformed("missing content cipher")),
        };
        core.input.consume(wire_len);
        self.deliver(core, &plain);
        self.seen_final |= last;
        self.phase = Phase::Definite {
            remaining: remaining - wire_len as u64,
        };
        Ok(true)
    }

    fn max_wire_segment(&self, core: &Core) -> usize {
        let size = self.segment_size.unwrap_or(core.settings.segment_size);
        // zstd worst case expansion stays well within this margin.
        size + size / 64 + 512 + TAG_SIZE
    }

    fn read_segment_header(&mut self, core: &mut Core) -> Result<bool> {
        let Some(bytes) = peek(core, SEGMENT_HEADER_SIZE) else {
            return Ok(false);
        };
        let (len, last) = parse_segment_header(bytes);
        if len == 0 && !last {
            if !self.seen_final {
                return Err(malformed("body ended before its final segment"));
            }
            core.input.consume(SEGMENT_HEADER_SIZE);
            self.phase = Phase::Trailer;
            return Ok(true);
        }
        if self.seen_final {
            return Err(malformed("segment after the final segment"));
        }
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > self.max_wire_segment(core) || len + SEGMENT_HEADER_SIZE > core.input.capacity() {
            return Err(malformed("segment too large"));
        }
        core.input.consume(SEGMENT_HEADER_SIZE);
        self.phase = Phase::Segment { len, last };
        Ok(true)
    }

    fn read_segment(&mut self, core: &mut Core, len: usize, last: bool) -> Result<bool> {
        if core.input.len() < len {
            return Ok(false);
        }
        let max_plain = match &self.codec {
            Some(codec) => codec.max_plain(len),
            None => return Err(malformed("segment without codec")),
        };
        if !self.has_room(core, max_plain)? {
            return Ok(false);
        }
        let mut wire = Zeroizing::new(core.input.peek()[..len].to_vec());
        Self::corrupt_if_armed(core, &mut wire);
        let plain = match self.codec.as_mut() {
            Some(codec) => codec.open(&wire, last)?,
            None => return Err(malformed("segment without codec")),
        };
        if plain.len() > max_plain {
            return Err(malformed("segment expands past its size"));
        }
        core.input.consume(len);
        self.deliver(core, &plain);
        self.seen_final |= last;
        self.phase = Phase::SegmentHeader;
        Ok(true)
    }

    // Trailer

    fn read_trailer(&mut self, core: &mut Core) -> Result<bool> {
        core.state = EnvelopeState::TrailerProcessing;
        let expected = if self.has(FLAG_ENCRYPTED) && !self.inner_type_read {
            RecordTag::InnerType
        } else if self.is_signed() && self.signature.is_none() {
            RecordTag::Signature
        } else {
            self.phase = Phase::Verify;
            return Ok(true);
        };
        let Some(head) = peek(core, RECORD_HEADER_SIZE) else {
            return Ok(false);
        };
        let (tag, len) = record_header(head);
        if RecordTag::from_byte(tag)? != expected {
            return Err(malformed("unexpected trailer record"));
        }
        let Some(record) = peek(core, RECORD_HEADER_SIZE + len) else {
            return Ok(false);
        };
        let value = record[RECORD_HEADER_SIZE..].to_vec();
        match expected {
            RecordTag::InnerType => {
                let cipher = self
                    .codec
                    .as_ref()
                    .and_then(|codec| codec.cipher.as_ref())
                    .ok_or_else(|| malformed("missing content cipher"))?;
                let content = cipher.open_inner_type(&value)?;
                core.content_type =
                    Some(ContentType::from_byte(content).ok_or_else(|| malformed("unknown content type"))?);
                self.inner_type_read = true;
            }
            _ => {
                let mut signature = decode_signature(&value)?;
                if core.faults.trip(FaultKind::CorruptSignature) {
                    signature[0] ^= 0x01;
                }
                self.signature = Some(signature);
            }
        }
        core.input.consume(RECORD_HEADER_SIZE + len);
        Ok(true)
    }

    fn verify(&mut self, core: &mut Core) -> Result<()> {
        if self.is_signed() {
            let hash = if self.has(FLAG_DETACHED) {
                match core.creds.detached_hash {
                    Some(hash) => hash,
                    None => return Err(core.suspend(ResourceKind::DetachedHash)),
                }
            } else {
                match (self.content_hash, self.hasher.take()) {
                    (Some(hash), _) => hash,
                    (None, Some(hasher)) => {
                        let hash: [u8; HASH_SIZE] = hasher.finalize().into();
                        self.content_hash = Some(hash);
                        hash
                    }
                    (None, None) => return Err(malformed("no content hash")),
                }
            };
            let signer = self.signer.ok_or_else(|| malformed("missing signer record"))?;
            let signature = self
                .signature
                .ok_or_else(|| malformed("missing signature"))?;

            let key = match core.creds.check_key.clone() {
                Some(key) => key,
                None => {
                    let found = match core.creds.keyset.clone() {
                        Some(keyset) => match keyset.lookup(ResourceKind::SignatureCheckKey, &signer) {
                            Ok(Credential::SignatureCheckKey(key)) => Some(key),
                            Ok(_) => None,
                            Err(err) if err.status() == Status::NotFound => None,
                            Err(err) => return Err(err),
                        },
                        None => None,
                    };
                    match found {
                        Some(key) => key,
                        None => return Err(core.suspend(ResourceKind::SignatureCheckKey)),
                    }
                }
            };
            if key.key_id() != signer {
                core.creds.check_key = None;
                core.suspend(ResourceKind::SignatureCheckKey);
                return Err(Error::with_detail(
                    Status::WrongKey,
                    "verification key does not belong to the signer",
                ));
            }
            key.verify(&hash, &signature)?;
            core.exchange.satisfy();
            core.released.extend(self.withheld.drain(..));
            self.withheld_len = 0;
            tracing::debug!(signer = %hex::encode(signer), "signature verified");
        }
        if core.content_type.is_none() {
            core.content_type = self.header.and_then(|header| ContentType::from_byte(header.content));
        }
        self.phase = Phase::Done;
        core.state = EnvelopeState::Complete;
        Ok(())
    }

    /// Advance as far as buffered input and output room allow.
    fn process(&mut self, core: &mut Core) -> Result<()> {
        self.blocked = false;
        if core.is_suspended() {
            let kind = core.exchange.pending().map(|request| request.kind);
            return Err(Error::with_detail(
                Status::ResourceNeeded,
                format!("{:?} required", kind.unwrap_or(ResourceKind::Password)),
            ));
        }
        loop {
            let progressed = match self.phase {
                Phase::Preamble => self.read_preamble(core)?,
                Phase::Records { left: 0 } => {
                    self.phase = Phase::Keys;
                    true
                }
                Phase::Records { left } => self.read_record(core, left)?,
                Phase::Keys => {
                    self.enter_keys(core)?;
                    true
                }
                Phase::BodyTag => self.read_body_tag(core)?,
                Phase::Definite { remaining } => self.read_definite(core, remaining)?,
                Phase::SegmentHeader => self.read_segment_header(core)?,
                Phase::Segment { len, last } => self.read_segment(core, len, last)?,
                Phase::Trailer => self.read_trailer(core)?,
                Phase::Verify => {
                    self.verify(core)?;
                    true
                }
                Phase::Done => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    // Façade

    pub(super) fn push(&mut self, core: &mut Core, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return self.flush(core).map(|()| 0);
        }
        if self.phase == Phase::Done {
            return Err(Error::new(Status::Complete));
        }
        let mut consumed = 0;
        loop {
            let n = core.input.write_some(&data[consumed..]);
            consumed += n;
            self.process(core).map_err(|err| err.consumed_bytes(consumed))?;
            if self.phase == Phase::Done && !core.input.is_empty() {
                // Bytes past the end of the envelope are not ours.
                let extra = core.input.len();
                core.input.wipe();
                consumed -= extra.min(n);
                return Ok(consumed);
            }
            if consumed == data.len() || n == 0 || core.input.room() == 0 {
                break;
            }
        }
        if consumed < data.len() {
            return Err(Error::with_detail(Status::Overflow, "input buffer full; pop output first")
                .consumed_bytes(consumed));
        }
        Ok(consumed)
    }

    pub(super) fn flush(&mut self, core: &mut Core) -> Result<()> {
        if self.phase == Phase::Done {
            return Ok(());
        }
        self.process(core)?;
        if self.phase == Phase::Done {
            return Ok(());
        }
        if self.blocked {
            return Err(Error::with_detail(Status::Overflow, "output buffer full; pop output first"));
        }
        Err(Error::with_detail(Status::Underflow, "envelope is incomplete"))
    }

    pub(super) fn pop(&mut self, core: &mut Core, out: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        loop {
            if !core.is_suspended() && self.phase != Phase::Done {
                if let Err(err) = self.process(core) {
                    if !err.is_recoverable() {
                        if n > 0 {
                            core.fail(err);
                            return Ok(n);
                        }
                        return Err(err);
                    }
                    n += core.drain(&mut out[n..]);
                    return if n > 0 { Ok(n) } else { Err(err) };
                }
            }
            let m = core.drain(&mut out[n..]);
            n += m;
            if m == 0 || n == out.len() {
                break;
            }
        }
        if n == 0 && core.is_suspended() {
            return Err(Error::with_detail(Status::ResourceNeeded, "credential required"));
        }
        Ok(n)
    }
}
