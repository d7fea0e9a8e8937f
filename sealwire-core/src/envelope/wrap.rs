//! Enveloping.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{self, SessionKey, SALT_SIZE};
use crate::error::{Error, Result, Status};
use crate::fault::FaultKind;
use crate::registry::Compression;

use super::format::{
    encode_cipher, encode_record, encode_signer, sealed_body_len, segment_header, Header,
    PasswordRecord, PublicKeyRecord, RecordTag, BODY_DEFINITE, BODY_NONE, BODY_SEGMENTED,
    CONTENT_OPAQUE, FLAG_COMPRESSED, FLAG_DETACHED, FLAG_ENCRYPTED, FLAG_SIGNED, FORMAT_VERSION,
    NONCE_PREFIX_SIZE, SEGMENT_HEADER_SIZE,
};
use super::segment::{SegmentCipher, SegmentCodec};
use super::{Core, EnvelopeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Body,
    FinalSegment,
    Terminator,
    InnerType,
    Signature,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Length declared up front; segments (if any) carry no headers.
    Definite { remaining: u64 },
    Segmented,
    Detached,
}

pub(super) struct Wrapper {
    stage: Stage,
    framing: Framing,
    codec: Option<SegmentCodec>,
    staging: Zeroizing<Vec<u8>>,
    final_emitted: bool,
    hasher: Option<Sha256>,
    signed: bool,
    trailer: Option<Vec<u8>>,
}

fn bad(detail: &str) -> Error {
    Error::with_detail(Status::BadParam, detail)
}

fn overflow(detail: &str) -> Error {
    Error::with_detail(Status::Overflow, detail)
}

impl Wrapper {
    pub(super) fn new() -> Self {
        Self {
            stage: Stage::Header,
            framing: Framing::Segmented,
            codec: None,
            staging: Zeroizing::new(Vec::new()),
            final_emitted: false,
            hasher: None,
            signed: false,
            trailer: None,
        }
    }

    pub(super) fn wipe(&mut self) {
        self.staging.zeroize();
        self.codec = None;
        self.hasher = None;
        self.trailer = None;
    }

    /// Validate the configuration, build the header and emit it.
    fn start(&mut self, core: &mut Core) -> Result<()> {
        let settings = &core.settings;
        let creds = &core.creds;
        if settings.segment_size * 2 > settings.buffer_size {
            return Err(bad("segment larger than half the buffer"));
        }
        let encrypted =
            !creds.passwords.is_empty() || !creds.recipients.is_empty() || creds.session_key.is_some();
        let signed = creds.signing_key.is_some();
        let detached = settings.detached;
        if detached && !signed {
            return Err(bad("detached signature needs a signing key"));
        }
        if detached && encrypted {
            return Err(bad("detached signatures cannot be encrypted"));
        }
        if creds.detached_hash.is_some() && !detached {
            return Err(bad("content hash only applies to detached signatures"));
        }
        let compress = settings.compress && !detached;
        if compress && !core.registry.supports_compression(Compression::Zstd) {
            return Err(bad("compression unavailable"));
        }

        let mut flags = 0u8;
        let mut records: Vec<Vec<u8>> = Vec::new();
        let mut cipher = None;
        if encrypted {
            flags |= FLAG_ENCRYPTED;
            let cek = creds
                .session_key
                .clone()
                .unwrap_or_else(|| Arc::new(SessionKey::generate()));
            let prefix: [u8; NONCE_PREFIX_SIZE] = crypto::random_bytes();
            records.push(encode_record(RecordTag::Cipher, &encode_cipher(&prefix))?);
            records.push(encode_record(
                RecordTag::Segment,
                &(settings.segment_size as u32).to_be_bytes(),
            )?);
            if creds.session_key.is_some() {
                records.push(encode_record(RecordTag::SessionKey, &cek.key_id())?);
            }
            for password in &creds.passwords {
                let salt: [u8; SALT_SIZE] = crypto::random_bytes();
                let kek = crypto::derive_key(
                    password.as_bytes(),
                    &salt,
                    settings.kdf_iterations,
                    settings.prf,
                )?;
                let wrapped = cek.wrap_under(&kek, &RecordTag::Password.aad())?;
                let record = PasswordRecord {
                    prf: settings.prf,
                    iterations: settings.kdf_iterations,
                    salt,
                    wrapped: wrapped
                        .as_slice()
                        .try_into()
                        .map_err(|_| bad("wrapped key has wrong length"))?,
                };
                records.push(encode_record(RecordTag::Password, &record.encode())?);
            }
            for recipient in &creds.recipients {
                let (ephemeral, wrapped) = recipient.wrap_key(&cek, &RecordTag::PublicKey.aad())?;
                let record = PublicKeyRecord {
                    key_id: recipient.key_id(),
                    ephemeral,
                    wrapped: wrapped
                        .as_slice()
                        .try_into()
                        .map_err(|_| bad("wrapped key has wrong length"))?,
                };
                records.push(encode_record(RecordTag::PublicKey, &record.encode())?);
            }
            cipher = Some(SegmentCipher::new(cek, prefix));
        } else if compress {
            records.push(encode_record(
                RecordTag::Segment,
                &(settings.segment_size as u32).to_be_bytes(),
            )?);
        }
        if compress {
            flags |= FLAG_COMPRESSED;
            records.push(encode_record(RecordTag::Compression, &[Compression::Zstd as u8])?);
        }
        if let Some(key) = &creds.signing_key {
            flags |= FLAG_SIGNED;
            records.push(encode_record(RecordTag::Signer, &encode_signer(&key.key_id()))?);
        }
        if detached {
            flags |= FLAG_DETACHED;
        }
        if records.len() > settings.max_records {
            return Err(bad("too many recipient records"));
        }

        let framing = if detached {
            Framing::Detached
        } else {
            match settings.data_size {
                Some(size) if !compress => Framing::Definite { remaining: size },
                _ => Framing::Segmented,
            }
        };

        let header = Header {
            version: FORMAT_VERSION,
            content: if encrypted {
                CONTENT_OPAQUE
            } else {
                settings.content_type as u8
            },
            flags,
            records: records.len() as u8,
        };
        let mut bytes = header.encode().to_vec();
        for record in &records {
            bytes.extend_from_slice(record);
        }
        match framing {
            Framing::Definite { remaining } => {
                bytes.push(BODY_DEFINITE);
                let body = if encrypted {
                    sealed_body_len(remaining, settings.segment_size)
                } else {
                    remaining
                };
                bytes.extend_from_slice(&body.to_be_bytes());
            }
            Framing::Segmented => bytes.push(BODY_SEGMENTED),
            Framing::Detached => bytes.push(BODY_NONE),
        }
        if core.faults.trip(FaultKind::CorruptHeader) {
            bytes[0] ^= 0x01;
        }
        if !core.output.write_all(&bytes) {
            return Err(bad("header does not fit the buffer"));
        }

        let staged = cipher.is_some() || matches!(framing, Framing::Segmented);
        self.codec = staged.then(|| SegmentCodec {
            cipher,
            compress,
            segment_size: settings.segment_size,
        });
        self.staging = Zeroizing::new(Vec::with_capacity(if staged { settings.segment_size } else { 0 }));
        self.hasher = (signed && creds.detached_hash.is_none()).then(Sha256::new);
        self.signed = signed;
        self.framing = framing;
        self.stage = Stage::Body;
        core.state = EnvelopeState::BodyProcessing;
        tracing::debug!(
            records = records.len(),
            encrypted,
            signed,
            compress,
            definite = matches!(framing, Framing::Definite { .. }),
            "envelope header emitted"
        );
        Ok(())
    }

    fn hash(&mut self, data: &[u8]) {
        if let Some(hasher) = &mut self.hasher {
            hasher.update(data);
        }
    }

    fn remaining(&self) -> Option<u64> {
        match self.framing {
            Framing::Definite { remaining } => Some(remaining),
            _ => None,
        }
    }

    fn take_from_remaining(&mut self, n: usize) {
        if let Framing::Definite { remaining } = &mut self.framing {
            *remaining -= n as u64;
        }
    }

    /// Seal and emit the staged segment if the output has room.
    fn emit_segment(&mut self, core: &mut Core, last: bool) -> Result<bool> {
        let segmented = matches!(self.framing, Framing::Segmented);
        let Some(codec) = self.codec.as_mut() else {
            return Ok(true);
        };
        let prepared = codec.prepare(&self.staging)?;
        let header_len = if segmented { SEGMENT_HEADER_SIZE } else { 0 };
        if core.output.room() < header_len + prepared.len() + codec.overhead() {
            return Ok(false);
        }
        let sealed = codec.seal(prepared, last)?;
        if segmented {
            core.output.write_all(&segment_header(sealed.len(), last));
        }
        core.output.write_all(&sealed);
        self.staging.zeroize();
        self.final_emitted = last;
        Ok(true)
    }

    fn push_body(&mut self, core: &mut Core, data: &[u8]) -> Result<usize> {
        if self.remaining() == Some(0) {
            return Err(overflow("more data than the declared size"));
        }
        match self.framing {
            Framing::Detached => {
                if core.creds.detached_hash.is_some() {
                    return Err(bad("content hash was supplied directly"));
                }
                self.hash(data);
                Ok(data.len())
            }
            Framing::Definite { remaining } if self.codec.is_none() => {
                let take = data
                    .len()
                    .min(core.output.room())
                    .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                core.output.write_all(&data[..take]);
                self.hash(&data[..take]);
                self.take_from_remaining(take);
                Ok(take)
            }
            _ => self.stage_data(core, data),
        }
    }

    fn stage_data(&mut self, core: &mut Core, data: &[u8]) -> Result<usize> {
        let segment_size = core.settings.segment_size;
        let mut taken = 0;
        loop {
            if self.staging.len() == segment_size && !self.final_emitted {
                let last = self.remaining() == Some(0);
                // A full segment is only sealed as non-final once more data
                // proves it is not the last one.
                if last || taken < data.len() {
                    if !self.emit_segment(core, last)? {
                        break;
                    }
                } else {
                    break;
                }
            }
            let mut take = (segment_size - self.staging.len()).min(data.len() - taken);
            if let Some(remaining) = self.remaining() {
                take = take.min(usize::try_from(remaining).unwrap_or(usize::MAX));
            }
            if take == 0 {
                break;
            }
            let chunk = &data[taken..taken + take];
            self.staging.extend_from_slice(chunk);
            self.hash(chunk);
            self.take_from_remaining(take);
            taken += take;
        }
        Ok(taken)
    }

    pub(super) fn push(&mut self, core: &mut Core, data: &[u8]) -> Result<usize> {
        if self.stage == Stage::Done {
            return Err(Error::new(Status::Complete));
        }
        if data.is_empty() {
            return self.flush(core).map(|()| 0);
        }
        if self.stage != Stage::Header && self.stage != Stage::Body {
            return Err(bad("data pushed after flush"));
        }
        if self.stage == Stage::Header {
            self.start(core)?;
        }
        let consumed = self.push_body(core, data)?;
        if consumed < data.len() {
            return Err(Error::with_detail(Status::Overflow, "output buffer full").consumed_bytes(consumed));
        }
        Ok(consumed)
    }

    fn write_trailer_record(core: &mut Core, record: &[u8]) -> Result<()> {
        if core.output.write_all(record) {
            Ok(())
        } else {
            Err(overflow("trailer does not fit; pop output and flush again"))
        }
    }

    pub(super) fn flush(&mut self, core: &mut Core) -> Result<()> {
        if self.stage == Stage::Header {
            self.start(core)?;
        }
        if let Some(remaining) = self.remaining() {
            if remaining > 0 && self.stage == Stage::Body {
                return Err(Error::with_detail(
                    Status::Underflow,
                    format!("{remaining} bytes short of the declared size"),
                ));
            }
        }
        loop {
            match self.stage {
                Stage::Header | Stage::Body => self.stage = Stage::FinalSegment,
                Stage::FinalSegment => {
                    if self.codec.is_some() && !self.final_emitted {
                        if !self.emit_segment(core, true)? {
                            return Err(overflow("final segment does not fit; pop output and flush again"));
                        }
                    }
                    self.stage = Stage::Terminator;
                }
                Stage::Terminator => {
                    if self.framing == Framing::Segmented {
                        Self::write_trailer_record(core, &[0u8; SEGMENT_HEADER_SIZE])?;
                    }
                    core.state = EnvelopeState::TrailerProcessing;
                    self.stage = Stage::InnerType;
                }
                Stage::InnerType => {
                    if let Some(cipher) = self.codec.as_ref().and_then(|codec| codec.cipher.as_ref()) {
                        let sealed = cipher.seal_inner_type(core.settings.content_type as u8)?;
                        let record = encode_record(RecordTag::InnerType, &sealed)?;
                        Self::write_trailer_record(core, &record)?;
                    }
                    self.stage = Stage::Signature;
                }
                Stage::Signature => {
                    if self.signed {
                        if self.trailer.is_none() {
                            self.trailer = Some(self.signature_record(core)?);
                        }
                        if let Some(record) = &self.trailer {
                            Self::write_trailer_record(core, record)?;
                        }
                    }
                    self.stage = Stage::Done;
                }
                Stage::Done => {
                    if core.state != EnvelopeState::Complete {
                        core.state = EnvelopeState::Complete;
                        tracing::debug!("envelope sealed");
                    }
                    return Ok(());
                }
            }
        }
    }

    fn signature_record(&mut self, core: &Core) -> Result<Vec<u8>> {
        let key = core
            .creds
            .signing_key
            .as_ref()
            .ok_or_else(|| bad("signing key missing"))?;
        let hash: [u8; 32] = match (core.creds.detached_hash, self.hasher.take()) {
            (Some(hash), _) => hash,
            (None, Some(hasher)) => hasher.finalize().into(),
            (None, None) => return Err(bad("no content hash")),
        };
        encode_record(RecordTag::Signature, &key.sign(&hash))
    }
}
