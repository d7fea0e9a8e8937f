//! Envelopes: one-shot protection of a data stream.
//!
//! A wrap envelope turns plaintext into a self-describing protected
//! stream (encrypted to passwords, public keys or a pre-shared key,
//! optionally signed and compressed). An unwrap envelope reverses it,
//! suspending for whatever credential the stream asks for.
//!
//! States: INIT → HEADER → [SUSPENDED] → BODY → TRAILER → COMPLETE, with
//! FAILED reachable from anywhere. A failure other than a recoverable
//! status is sticky: every later call returns the same error.

pub mod format;
mod segment;
mod unwrap;
mod wrap;

use std::collections::VecDeque;
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::attribute::{Attribute, AttributeClass, ContentType, Handle};
use crate::buffer::AttributeSource;
use crate::config::EngineConfig;
use crate::credential::{Candidate, CredentialExchange, CredentialLookup, ResourceKind};
use crate::crypto::{PrivateKey, Prf, PublicKey, SessionKey, SigningKey, VerifyKey, HASH_SIZE};
use crate::error::{Error, Result, Status};
use crate::fault::FaultController;
use crate::registry::Registry;
use crate::stream::{StreamBuffer, Transform};

use unwrap::Unwrapper;
use wrap::Wrapper;

/// Direction of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeMode {
    /// Protect plaintext.
    Wrap,
    /// Recover plaintext.
    Unwrap,
}

/// Envelope lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    /// Created, nothing processed.
    Init,
    /// Reading or writing the header and records.
    HeaderParsing,
    /// Waiting for a credential.
    SuspendedNeedsResource(ResourceKind),
    /// Moving payload.
    BodyProcessing,
    /// Reading or writing trailer records.
    TrailerProcessing,
    /// Finished; remaining output can still be popped.
    Complete,
    /// Failed with a sticky status.
    Failed(Status),
}

struct Settings {
    buffer_size: usize,
    segment_size: usize,
    kdf_iterations: u32,
    prf: Prf,
    data_size: Option<u64>,
    compress: bool,
    detached: bool,
    content_type: ContentType,
    max_records: usize,
}

impl Settings {
    fn from_config(config: &EngineConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            segment_size: config.segment_size,
            kdf_iterations: config.kdf_iterations,
            prf: config.kdf_prf.into(),
            data_size: None,
            compress: false,
            detached: false,
            content_type: ContentType::Data,
            max_records: config.max_records,
        }
    }
}

#[derive(Default)]
struct Credentials {
    passwords: VecDeque<Zeroizing<String>>,
    recipients: Vec<Arc<PublicKey>>,
    private_key: Option<Arc<PrivateKey>>,
    session_key: Option<Arc<SessionKey>>,
    signing_key: Option<Arc<SigningKey>>,
    check_key: Option<Arc<VerifyKey>>,
    keyset: Option<Arc<dyn CredentialLookup>>,
    detached_hash: Option<[u8; HASH_SIZE]>,
}

/// State shared by both directions.
struct Core {
    state: EnvelopeState,
    settings: Settings,
    creds: Credentials,
    input: StreamBuffer,
    output: StreamBuffer,
    /// Verified plaintext released after a signature check, in chunks so
    /// nothing is ever reallocated.
    released: VecDeque<Zeroizing<Vec<u8>>>,
    exchange: CredentialExchange,
    registry: Arc<Registry>,
    faults: Arc<FaultController>,
    content_type: Option<ContentType>,
    fault: Option<Error>,
}

impl Core {
    fn started(&self) -> bool {
        self.state != EnvelopeState::Init
    }

    fn suspend(&mut self, kind: ResourceKind) -> Error {
        self.exchange.suspend(kind);
        self.state = EnvelopeState::SuspendedNeedsResource(kind);
        tracing::debug!(resource = ?kind, "envelope suspended");
        Error::with_detail(Status::ResourceNeeded, format!("{kind:?} required"))
    }

    fn is_suspended(&self) -> bool {
        matches!(self.state, EnvelopeState::SuspendedNeedsResource(_))
    }

    /// Record a sticky failure.
    fn fail(&mut self, err: Error) -> Error {
        if self.fault.is_none() {
            tracing::debug!(status = ?err.status(), "envelope failed");
            self.state = EnvelopeState::Failed(err.status());
            self.fault = Some(err.clone());
        }
        err
    }

    fn drain(&mut self, out: &mut [u8]) -> usize {
        let mut n = self.output.read_into(out);
        while n < out.len() {
            let Some(chunk) = self.released.front_mut() else {
                break;
            };
            let take = chunk.len().min(out.len() - n);
            out[n..n + take].copy_from_slice(&chunk[..take]);
            n += take;
            if take == chunk.len() {
                self.released.pop_front();
            } else {
                // Shift the tail down in place; the vacated bytes are wiped.
                chunk.copy_within(take.., 0);
                let keep = chunk.len() - take;
                zeroize::Zeroize::zeroize(&mut chunk[keep..]);
                chunk.truncate(keep);
            }
        }
        n
    }

    fn wipe(&mut self) {
        self.input.wipe();
        self.output.wipe();
        self.released.clear();
    }
}

enum Direction {
    Wrap(Wrapper),
    Unwrap(Unwrapper),
}

/// An envelope object.
pub struct Envelope {
    mode: EnvelopeMode,
    core: Core,
    direction: Direction,
    last_error: Option<String>,
    scrubbed: bool,
}

fn bad(detail: &str) -> Error {
    Error::with_detail(Status::BadParam, detail)
}

impl Envelope {
    pub(crate) fn new(
        mode: EnvelopeMode,
        config: &EngineConfig,
        registry: Arc<Registry>,
        faults: Arc<FaultController>,
    ) -> Result<Self> {
        let settings = Settings::from_config(config);
        let direction = match mode {
            EnvelopeMode::Wrap => Direction::Wrap(Wrapper::new()),
            EnvelopeMode::Unwrap => Direction::Unwrap(Unwrapper::new()?),
        };
        Ok(Self {
            mode,
            core: Core {
                state: EnvelopeState::Init,
                input: StreamBuffer::new(settings.buffer_size)?,
                output: StreamBuffer::new(settings.buffer_size)?,
                settings,
                creds: Credentials::default(),
                released: VecDeque::new(),
                exchange: CredentialExchange::new(),
                registry,
                faults,
                content_type: None,
                fault: None,
            },
            direction,
            last_error: None,
            scrubbed: false,
        })
    }

    /// Direction.
    pub fn mode(&self) -> EnvelopeMode {
        self.mode
    }

    /// Lifecycle state.
    pub fn state(&self) -> EnvelopeState {
        self.core.state
    }

    /// Possible key holders found in the header.
    pub fn candidates(&self) -> &[Candidate] {
        self.core.exchange.candidates()
    }

    /// Content type, once known. Encrypted envelopes only reveal it after
    /// the trailer has been processed.
    pub fn content_type(&self) -> Option<ContentType> {
        match self.mode {
            EnvelopeMode::Wrap => Some(self.core.settings.content_type),
            EnvelopeMode::Unwrap => self.core.content_type,
        }
    }

    /// Replace the fault controller.
    pub fn set_fault_controller(&mut self, faults: Arc<FaultController>) {
        self.core.faults = faults;
    }

    fn check_config_change(&self) -> Result<()> {
        if self.core.started() {
            return Err(bad("envelope already started"));
        }
        Ok(())
    }

    fn wrap_only(&self) -> Result<()> {
        if self.mode != EnvelopeMode::Wrap {
            return Err(bad("attribute only applies when wrapping"));
        }
        self.check_config_change()
    }

    /// Set a numeric attribute.
    pub fn set_numeric(&mut self, attr: Attribute, value: i64) -> Result<()> {
        attr.validate_numeric(value)?;
        self.fail_if_faulted()?;
        // Ranges were checked above, so the narrowing casts below hold.
        let settings = &self.core.settings;
        match attr {
            Attribute::BufferSize => {
                self.check_config_change()?;
                let size = value as usize;
                if settings.segment_size * 2 > size {
                    return Err(bad("buffer must hold two segments"));
                }
                if !self.core.input.is_empty() || !self.core.output.is_empty() {
                    return Err(bad("buffer size cannot change while data is buffered"));
                }
                let input = StreamBuffer::new(size)?;
                let output = StreamBuffer::new(size)?;
                self.core.input = input;
                self.core.output = output;
                self.core.settings.buffer_size = size;
            }
            Attribute::SegmentSize => {
                self.wrap_only()?;
                let size = value as usize;
                if size * 2 > settings.buffer_size {
                    return Err(bad("segment larger than half the buffer"));
                }
                self.core.settings.segment_size = size;
            }
            Attribute::DataSize => {
                self.wrap_only()?;
                self.core.settings.data_size = Some(value as u64);
            }
            Attribute::KdfIterations => {
                self.wrap_only()?;
                self.core.settings.kdf_iterations = value as u32;
            }
            Attribute::Prf => {
                self.wrap_only()?;
                self.core.settings.prf = Prf::from_byte(value as u8).map_err(|_| bad("unknown prf"))?;
            }
            Attribute::Compression => {
                self.wrap_only()?;
                self.core.settings.compress = value == 1;
            }
            Attribute::DetachedSignature => {
                self.wrap_only()?;
                self.core.settings.detached = value == 1;
            }
            Attribute::ContentType => {
                self.wrap_only()?;
                self.core.settings.content_type =
                    ContentType::from_byte(value as u8).ok_or_else(|| bad("unknown content type"))?;
            }
            _ => return Err(bad("attribute does not apply to envelopes")),
        }
        Ok(())
    }

    /// Read a numeric attribute.
    pub fn get_numeric(&self, attr: Attribute) -> Result<i64> {
        let settings = &self.core.settings;
        let value = match attr {
            Attribute::BufferSize => settings.buffer_size as i64,
            Attribute::SegmentSize => settings.segment_size as i64,
            Attribute::KdfIterations => i64::from(settings.kdf_iterations),
            Attribute::Prf => i64::from(settings.prf.to_byte()),
            Attribute::Compression => i64::from(settings.compress),
            Attribute::DetachedSignature => i64::from(settings.detached),
            Attribute::DataSize => settings
                .data_size
                .map(|size| size as i64)
                .ok_or_else(|| Error::new(Status::NotFound))?,
            Attribute::ContentType => self
                .content_type()
                .map(|ct| ct as i64)
                .ok_or_else(|| Error::new(Status::NotFound))?,
            Attribute::CurrentCandidate => self.core.exchange.cursor() as i64,
            _ => return Err(bad("attribute does not apply to envelopes")),
        };
        Ok(value)
    }

    /// Set a text attribute. For unwrap envelopes a password is a
    /// credential attempt; for wrap envelopes it adds a recipient.
    pub fn set_string(&mut self, attr: Attribute, value: &str) -> Result<()> {
        attr.validate_text(value)?;
        self.fail_if_faulted()?;
        if attr != Attribute::Password {
            return Err(bad("attribute does not apply to envelopes"));
        }
        let password = Zeroizing::new(value.to_owned());
        let result = match &mut self.direction {
            Direction::Wrap(_) => {
                if self.core.started() {
                    Err(bad("envelope already started"))
                } else {
                    self.core.creds.passwords.push_back(password);
                    Ok(())
                }
            }
            Direction::Unwrap(unwrapper) => unwrapper.supply_password(&mut self.core, password),
        };
        self.settle(result)
    }

    /// Set a handle attribute.
    pub fn set_handle(&mut self, attr: Attribute, handle: Handle) -> Result<()> {
        attr.validate_handle(&handle)?;
        self.fail_if_faulted()?;
        let result = match &mut self.direction {
            Direction::Wrap(_) => {
                if self.core.started() {
                    Err(bad("envelope already started"))
                } else {
                    let creds = &mut self.core.creds;
                    match handle {
                        Handle::PublicKey(key) => creds.recipients.push(key),
                        Handle::SessionKey(key) => creds.session_key = Some(key),
                        Handle::SigningKey(key) => creds.signing_key = Some(key),
                        Handle::Hash(hash) => creds.detached_hash = Some(hash),
                        _ => return Err(bad("handle does not apply when wrapping")),
                    }
                    Ok(())
                }
            }
            Direction::Unwrap(unwrapper) => unwrapper.supply_handle(&mut self.core, handle),
        };
        self.settle(result)
    }

    /// Generic attribute read for text attributes.
    pub fn get_string(&self, attr: Attribute) -> Result<String> {
        if attr.class() != AttributeClass::Text {
            return Err(bad("attribute is not text"));
        }
        match attr {
            Attribute::ErrorMessage => self
                .last_error
                .clone()
                .ok_or_else(|| Error::new(Status::NotFound)),
            _ => Err(Error::new(Status::NotFound)),
        }
    }

    /// Destroy the envelope, wiping all buffered data and key material.
    pub fn destroy(self) {
        drop(self);
    }

    fn wipe(&mut self) {
        self.core.wipe();
        self.core.creds = Credentials::default();
        match &mut self.direction {
            Direction::Wrap(wrapper) => wrapper.wipe(),
            Direction::Unwrap(unwrapper) => unwrapper.wipe(),
        }
    }

    fn fail_if_faulted(&self) -> Result<()> {
        match &self.core.fault {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Partial plaintext may still be popped after a failure when nothing
    /// is being withheld for a signature check.
    fn partial_output_allowed(&self) -> bool {
        match &self.direction {
            Direction::Wrap(_) => false,
            Direction::Unwrap(unwrapper) => !unwrapper.is_signed(),
        }
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        let result = match result {
            Err(err) if !err.is_recoverable() => Err(self.core.fail(err)),
            other => other,
        };
        if let Err(err) = &result {
            self.last_error = Some(err.to_string());
        }
        if self.core.fault.is_some() && !self.scrubbed {
            self.core.input.wipe();
            self.core.released.clear();
            if !self.partial_output_allowed() {
                self.core.output.wipe();
            }
            match &mut self.direction {
                Direction::Wrap(wrapper) => wrapper.wipe(),
                Direction::Unwrap(unwrapper) => unwrapper.wipe(),
            }
            self.scrubbed = true;
        }
        result
    }
}

impl Transform for Envelope {
    fn push(&mut self, data: &[u8]) -> Result<usize> {
        self.fail_if_faulted()?;
        let result = match &mut self.direction {
            Direction::Wrap(wrapper) => wrapper.push(&mut self.core, data),
            Direction::Unwrap(unwrapper) => unwrapper.push(&mut self.core, data),
        };
        self.settle(result)
    }

    fn flush(&mut self) -> Result<()> {
        self.fail_if_faulted()?;
        let result = match &mut self.direction {
            Direction::Wrap(wrapper) => wrapper.flush(&mut self.core),
            Direction::Unwrap(unwrapper) => unwrapper.flush(&mut self.core),
        };
        self.settle(result)
    }

    fn pop(&mut self, out: &mut [u8]) -> Result<usize> {
        if let Some(err) = &self.core.fault {
            let n = self.core.output.read_into(out);
            return if n > 0 { Ok(n) } else { Err(err.clone()) };
        }
        let result = match &mut self.direction {
            Direction::Wrap(_) => Ok(self.core.drain(out)),
            Direction::Unwrap(unwrapper) => unwrapper.pop(&mut self.core, out),
        };
        self.settle(result)
    }

    fn required_resource(&self) -> Option<ResourceKind> {
        self.core.exchange.pending().map(|request| request.kind)
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

impl AttributeSource for Envelope {
    fn read_attribute(&self, attr: Attribute, out: Option<&mut [u8]>) -> Result<usize> {
        let value = self.get_string(attr)?;
        if let Some(out) = out {
            out.get_mut(..value.len())
                .ok_or_else(|| Error::new(Status::Overflow))?
                .copy_from_slice(value.as_bytes());
        }
        Ok(value.len())
    }

    fn fault_controller(&self) -> Option<&FaultController> {
        Some(&*self.core.faults)
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("mode", &self.mode)
            .field("state", &self.core.state)
            .finish()
    }
}
