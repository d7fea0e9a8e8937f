//! Sessions: a client/server handshake over a byte transport, followed by
//! an encrypted bidirectional channel.
//!
//! States: INIT → NEGOTIATING → AUTHENTICATING → ESTABLISHED → CLOSED,
//! with FAILED reachable from anywhere.
//!
//! Handshake:
//! ```text
//! client                                server
//!   Hello(max version, suites)  ─────▶
//!                               ◀─────  Hello(version, suite)
//!   Handshake(noise 1)          ─────▶
//!                               ◀─────  Handshake(noise 2)
//!   Handshake(noise 3)          ─────▶
//!   AuthRequest(user, password) ─────▶  [Authorization]
//!                               ◀─────  AuthResponse(verdict)
//! ```
//!
//! The server may deny a login and wait for another, up to
//! `auth_retry_limit` attempts; the last denial ends the session on both
//! sides with `WrongKey`. Transport failures are fatal. Timeouts are not:
//! the caller retries the same call.

mod noise;
pub mod record;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::attribute::{Attribute, AttributeClass, Handle};
use crate::buffer::AttributeSource;
use crate::config::EngineConfig;
use crate::credential::{Credential, CredentialExchange, CredentialLookup, ResourceKind};
use crate::crypto::PrivateKey;
use crate::error::{Error, Result, Status};
use crate::fault::{FaultController, FaultKind};
use crate::registry::Registry;
use crate::stream::{StreamBuffer, Transform};
use crate::transport::Transport;

use noise::NoiseSession;
use record::{Record, RecordType, MAX_PLAINTEXT_LENGTH, MAX_RECORD_SIZE};

/// Login verdicts carried in an AuthResponse.
const VERDICT_APPROVED: u8 = 0;
const VERDICT_DENIED: u8 = 1;
const VERDICT_REFUSED: u8 = 2;

const READ_CHUNK: usize = 4096;

/// Side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the first hello and logs in.
    Client,
    /// Holds the static key and decides logins.
    Server,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet activated.
    Init,
    /// Exchanging hellos and Noise messages.
    Negotiating,
    /// Channel keyed; login in progress.
    Authenticating,
    /// Data may flow both ways.
    Established,
    /// Closed by either side.
    Closed,
    /// Failed with a sticky status.
    Failed(Status),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Start,
    AwaitHello,
    AwaitNoise,
    SendLogin,
    AwaitVerdict,
    AwaitLogin,
    Decide,
    Done,
}

struct Login {
    username: String,
    password: Zeroizing<String>,
}

/// A session object.
pub struct Session {
    role: Role,
    state: SessionState,
    step: Step,
    activated: bool,
    max_version: u8,
    version: Option<u8>,
    auth_retry_limit: u32,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
    manual_auth: bool,
    registry: Arc<Registry>,
    faults: Arc<FaultController>,
    transport: Box<dyn Transport>,
    noise: Option<NoiseSession>,
    static_key: Option<Arc<PrivateKey>>,
    keyset: Option<Arc<dyn CredentialLookup>>,
    username: Option<String>,
    password: Option<Zeroizing<String>>,
    login: Option<Login>,
    decision: Option<bool>,
    peer_identity: Option<String>,
    attempts: u32,
    prologue: Vec<u8>,
    exchange: CredentialExchange,
    incoming: StreamBuffer,
    outgoing: Vec<u8>,
    send_buf: StreamBuffer,
    received: VecDeque<Zeroizing<Vec<u8>>>,
    fault: Option<Error>,
    last_error: Option<String>,
}

fn bad(detail: &str) -> Error {
    Error::with_detail(Status::BadParam, detail)
}

fn malformed(detail: &str) -> Error {
    Error::with_detail(Status::BadData, detail)
}

fn deadline(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Session {
    pub(crate) fn new(
        role: Role,
        config: &EngineConfig,
        registry: Arc<Registry>,
        faults: Arc<FaultController>,
        mut transport: Box<dyn Transport>,
    ) -> Result<Self> {
        transport.set_read_timeout(deadline(config.read_timeout_ms))?;
        transport.set_write_timeout(deadline(config.write_timeout_ms))?;
        Ok(Self {
            role,
            state: SessionState::Init,
            step: Step::Start,
            activated: false,
            max_version: registry.max_version(),
            version: None,
            auth_retry_limit: config.auth_retry_limit,
            read_timeout_ms: config.read_timeout_ms,
            write_timeout_ms: config.write_timeout_ms,
            manual_auth: false,
            registry,
            faults,
            transport,
            noise: None,
            static_key: None,
            keyset: None,
            username: None,
            password: None,
            login: None,
            decision: None,
            peer_identity: None,
            attempts: 0,
            prologue: Vec::new(),
            exchange: CredentialExchange::new(),
            incoming: StreamBuffer::new(MAX_RECORD_SIZE)?,
            outgoing: Vec::new(),
            send_buf: StreamBuffer::new(config.buffer_size)?,
            received: VecDeque::new(),
            fault: None,
            last_error: None,
        })
    }

    /// Side of the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> Option<u8> {
        self.version
    }

    /// Identity the server approved.
    pub fn peer_identity(&self) -> Option<&str> {
        self.peer_identity.as_deref()
    }

    /// Fingerprint of the peer's static key, once keyed.
    pub fn fingerprint(&self) -> Option<String> {
        self.noise.as_ref()?.fingerprint()
    }

    /// Replace the fault controller.
    pub fn set_fault_controller(&mut self, faults: Arc<FaultController>) {
        self.faults = faults;
    }

    // Attributes

    fn before_activation(&self) -> Result<()> {
        if self.activated {
            return Err(bad("session already active"));
        }
        Ok(())
    }

    fn fail_if_faulted(&self) -> Result<()> {
        match &self.fault {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Set a numeric attribute. Writing 1 to [`Attribute::Active`] starts
    /// the handshake.
    pub fn set_numeric(&mut self, attr: Attribute, value: i64) -> Result<()> {
        attr.validate_numeric(value)?;
        self.fail_if_faulted()?;
        // Ranges were checked above, so the narrowing casts below hold.
        match attr {
            Attribute::BufferSize => {
                self.before_activation()?;
                self.send_buf.set_capacity(value as usize)?;
            }
            Attribute::Version => {
                self.before_activation()?;
                self.max_version = value as u8;
            }
            Attribute::AuthRetryLimit => self.auth_retry_limit = value as u32,
            Attribute::ReadTimeout => {
                self.transport.set_read_timeout(deadline(value as u64))?;
                self.read_timeout_ms = value as u64;
            }
            Attribute::WriteTimeout => {
                self.transport.set_write_timeout(deadline(value as u64))?;
                self.write_timeout_ms = value as u64;
            }
            Attribute::ManualAuth => {
                if self.role != Role::Server {
                    return Err(bad("only servers decide logins"));
                }
                self.before_activation()?;
                self.manual_auth = value == 1;
            }
            Attribute::Active => {
                if value == 0 {
                    return Err(bad("destroy a session to end it"));
                }
                self.before_activation()?;
                self.activated = true;
                tracing::debug!(role = ?self.role, "session activated");
                let result = self.resume();
                return self.settle(result);
            }
            Attribute::AuthResponse => {
                if self.role != Role::Server || self.required_resource() != Some(ResourceKind::Authorization) {
                    return Err(bad("no login is awaiting a decision"));
                }
                self.decision = Some(value == 1);
                let result = self.resume();
                return self.settle(result);
            }
            _ => return Err(bad("attribute does not apply to sessions")),
        }
        Ok(())
    }

    /// Read a numeric attribute.
    pub fn get_numeric(&self, attr: Attribute) -> Result<i64> {
        let value = match attr {
            Attribute::BufferSize => self.send_buf.capacity() as i64,
            Attribute::Version => i64::from(self.version.unwrap_or(self.max_version)),
            Attribute::AuthRetryLimit => i64::from(self.auth_retry_limit),
            Attribute::ReadTimeout => self.read_timeout_ms as i64,
            Attribute::WriteTimeout => self.write_timeout_ms as i64,
            Attribute::ManualAuth => i64::from(self.manual_auth),
            Attribute::Active => i64::from(self.state == SessionState::Established),
            _ => return Err(bad("attribute does not apply to sessions")),
        };
        Ok(value)
    }

    /// Set a text attribute. Clients set their username and password; a
    /// password supplied while suspended resumes the handshake.
    pub fn set_string(&mut self, attr: Attribute, value: &str) -> Result<()> {
        attr.validate_text(value)?;
        self.fail_if_faulted()?;
        if self.role != Role::Client {
            return Err(bad("servers do not take login credentials"));
        }
        if matches!(self.state, SessionState::Established | SessionState::Closed) {
            return Err(bad("session already authenticated"));
        }
        match attr {
            Attribute::Username => {
                self.username = Some(value.to_owned());
                Ok(())
            }
            Attribute::Password => {
                self.password = Some(Zeroizing::new(value.to_owned()));
                if self.activated && self.required_resource() == Some(ResourceKind::Password) {
                    let result = self.resume();
                    return self.settle(result);
                }
                Ok(())
            }
            _ => Err(bad("attribute does not apply to sessions")),
        }
    }

    /// Read a text attribute. On a server, `Username` is the name of the
    /// login awaiting a decision, or the approved identity.
    pub fn get_string(&self, attr: Attribute) -> Result<String> {
        if attr.class() != AttributeClass::Text {
            return Err(bad("attribute is not text"));
        }
        let value = match attr {
            Attribute::Username => match self.role {
                Role::Client => self.username.clone(),
                Role::Server => self
                    .login
                    .as_ref()
                    .map(|login| login.username.clone())
                    .or_else(|| self.peer_identity.clone()),
            },
            Attribute::Fingerprint => self.fingerprint(),
            Attribute::PeerIdentity => self.peer_identity.clone(),
            Attribute::ErrorMessage => self.last_error.clone(),
            _ => None,
        };
        value.ok_or_else(|| Error::new(Status::NotFound))
    }

    /// Set a handle attribute: the static private key, or a keyset the
    /// server checks logins against.
    pub fn set_handle(&mut self, attr: Attribute, handle: Handle) -> Result<()> {
        attr.validate_handle(&handle)?;
        self.fail_if_faulted()?;
        match handle {
            Handle::PrivateKey(key) => {
                if self.step != Step::Start {
                    return Err(bad("handshake already under way"));
                }
                self.static_key = Some(key);
            }
            Handle::Keyset(keyset) => {
                if self.role != Role::Server {
                    return Err(bad("only servers check logins"));
                }
                self.keyset = Some(keyset);
            }
            _ => return Err(bad("handle does not apply to sessions")),
        }
        if self.activated && self.required_resource().is_some() {
            let result = self.resume();
            return self.settle(result);
        }
        Ok(())
    }

    // Failure handling

    fn fail(&mut self, err: Error) -> Error {
        if self.fault.is_none() {
            tracing::warn!(role = ?self.role, status = ?err.status(), "session failed");
            self.state = SessionState::Failed(err.status());
            self.step = Step::Done;
            self.fault = Some(err.clone());
            if let Some(noise) = &mut self.noise {
                noise.terminate();
            }
            self.login = None;
            self.password = None;
            self.send_buf.wipe();
            self.incoming.wipe();
        }
        err
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.last_error = Some(err.to_string());
                if err.is_recoverable() {
                    Err(err)
                } else {
                    Err(self.fail(err))
                }
            }
        }
    }

    fn suspend(&mut self, kind: ResourceKind) -> Error {
        self.exchange.suspend(kind);
        tracing::debug!(role = ?self.role, resource = ?kind, "session suspended");
        Error::with_detail(Status::ResourceNeeded, format!("{kind:?} required"))
    }

    // Transport plumbing

    fn write_pending(&mut self) -> Result<()> {
        while !self.outgoing.is_empty() {
            if self.faults.trip(FaultKind::TransportWrite) {
                return Err(Error::with_detail(Status::Write, "transport write failed"));
            }
            let n = self.transport.write(&self.outgoing)?;
            if n == 0 {
                return Err(Error::with_detail(Status::Write, "transport accepted no bytes"));
            }
            self.outgoing.drain(..n);
        }
        Ok(())
    }

    fn queue(&mut self, kind: RecordType, payload: Vec<u8>) -> Result<()> {
        let record = Record::new(kind, payload)?;
        self.outgoing.extend_from_slice(&record.to_wire());
        Ok(())
    }

    fn noise_mut(&mut self) -> Result<&mut NoiseSession> {
        self.noise
            .as_mut()
            .ok_or_else(|| Error::with_detail(Status::BadParam, "channel not keyed"))
    }

    fn queue_sealed(&mut self, kind: RecordType, plaintext: &[u8]) -> Result<()> {
        let ciphertext = self.noise_mut()?.encrypt(plaintext)?;
        self.queue(kind, ciphertext)
    }

    /// Next record from the peer; `None` once the peer has gone away.
    fn receive(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(record) = record::take_record(&mut self.incoming)? {
                return Ok(Some(record));
            }
            if self.faults.trip(FaultKind::TransportRead) {
                return Err(Error::with_detail(Status::Read, "transport read failed"));
            }
            let mut chunk = Zeroizing::new([0u8; READ_CHUNK]);
            let want = self.incoming.room().min(READ_CHUNK);
            let n = self.transport.read(&mut chunk[..want])?;
            if n == 0 {
                return Ok(None);
            }
            self.incoming.write_some(&chunk[..n]);
        }
    }

    /// Next handshake record, which must be of `kind`.
    fn expect(&mut self, kind: RecordType) -> Result<Record> {
        match self.receive()? {
            Some(record) if record.kind() == kind => Ok(record),
            Some(record) if record.kind() == RecordType::Close => {
                Err(Error::with_detail(Status::Read, "peer closed the session"))
            }
            Some(_) => Err(malformed("unexpected record during handshake")),
            None => Err(Error::with_detail(Status::Read, "connection closed during handshake")),
        }
    }

    // Handshake

    /// Run the handshake until it completes, suspends or would block.
    fn drive(&mut self) -> Result<()> {
        self.write_pending()?;
        while self.step != Step::Done {
            match (self.role, self.step) {
                (Role::Client, Step::Start) => self.client_hello()?,
                (Role::Server, Step::Start) => self.server_start()?,
                (Role::Client, Step::AwaitHello) => self.client_await_hello()?,
                (Role::Server, Step::AwaitHello) => self.server_await_hello()?,
                (_, Step::AwaitNoise) => self.await_noise()?,
                (Role::Client, Step::SendLogin) => self.send_login()?,
                (Role::Client, Step::AwaitVerdict) => self.await_verdict()?,
                (Role::Server, Step::AwaitLogin) => self.await_login()?,
                (Role::Server, Step::Decide) => self.decide()?,
                _ => return Err(bad("handshake step does not apply to this role")),
            }
            self.write_pending()?;
        }
        Ok(())
    }

    /// Drive, treating a timeout as "still in progress".
    fn resume(&mut self) -> Result<()> {
        match self.drive() {
            Err(err) if err.status() == Status::Timeout => Ok(()),
            other => other,
        }
    }

    fn client_hello(&mut self) -> Result<()> {
        let suites = self.registry.suites();
        let count = u8::try_from(suites.len()).map_err(|_| bad("too many suites"))?;
        let mut hello = vec![self.max_version, count];
        hello.extend(suites.iter().map(|suite| suite.id));
        self.prologue = hello.clone();
        self.queue(RecordType::Hello, hello)?;
        self.state = SessionState::Negotiating;
        self.step = Step::AwaitHello;
        Ok(())
    }

    fn client_await_hello(&mut self) -> Result<()> {
        let record = self.expect(RecordType::Hello)?;
        let &[version, suite_id] = record.payload() else {
            return Err(malformed("malformed server hello"));
        };
        if version > self.max_version || !self.registry.supports_version(version) {
            return Err(malformed("server chose an unsupported version"));
        }
        let suite = self
            .registry
            .suite(suite_id)
            .ok_or_else(|| malformed("server chose an unknown suite"))?;
        self.prologue.extend_from_slice(record.payload());

        let local = match &self.static_key {
            Some(key) => Arc::clone(key),
            None => Arc::new(PrivateKey::generate()),
        };
        let mut noise = NoiseSession::new(true, suite, &local, &self.prologue)?;
        let first = noise.write_handshake()?;
        self.noise = Some(noise);
        self.version = Some(version);
        self.queue(RecordType::Handshake, first)?;
        self.step = Step::AwaitNoise;
        tracing::debug!(version, suite = suite.pattern, "client negotiated");
        Ok(())
    }

    fn server_start(&mut self) -> Result<()> {
        if self.static_key.is_none() {
            return Err(self.suspend(ResourceKind::PrivateKey));
        }
        self.exchange.satisfy();
        self.state = SessionState::Negotiating;
        self.step = Step::AwaitHello;
        Ok(())
    }

    fn server_await_hello(&mut self) -> Result<()> {
        let record = self.expect(RecordType::Hello)?;
        let hello = record.payload();
        let Some((&offered_max, rest)) = hello.split_first() else {
            return Err(malformed("malformed client hello"));
        };
        let Some((&count, offered)) = rest.split_first() else {
            return Err(malformed("malformed client hello"));
        };
        if offered.len() != usize::from(count) {
            return Err(malformed("malformed client hello"));
        }
        let agreed = self
            .registry
            .negotiate_version(offered_max.min(self.max_version))
            .zip(self.registry.select_suite(offered));
        let Some((version, suite)) = agreed else {
            self.outgoing.extend_from_slice(&Record::close().to_wire());
            // Best effort: the failure below is what the caller sees.
            let _ = self.write_pending();
            return Err(malformed("no common version or suite"));
        };
        let key = self
            .static_key
            .clone()
            .ok_or_else(|| bad("server has no static key"))?;

        let mut prologue = hello.to_vec();
        prologue.extend_from_slice(&[version, suite.id]);
        self.noise = Some(NoiseSession::new(false, suite, &key, &prologue)?);
        self.prologue = prologue;
        self.version = Some(version);
        self.queue(RecordType::Hello, vec![version, suite.id])?;
        self.step = Step::AwaitNoise;
        tracing::debug!(version, suite = suite.pattern, "server negotiated");
        Ok(())
    }

    fn await_noise(&mut self) -> Result<()> {
        let record = self.expect(RecordType::Handshake)?;
        let noise = self.noise_mut()?;
        noise.read_handshake(record.payload())?;
        let reply = if !noise.is_handshake_complete() && noise.is_my_turn() {
            Some(noise.write_handshake()?)
        } else {
            None
        };
        let complete = noise.is_handshake_complete();
        if let Some(message) = reply {
            self.queue(RecordType::Handshake, message)?;
        }
        if complete {
            self.state = SessionState::Authenticating;
            self.step = match self.role {
                Role::Client => Step::SendLogin,
                Role::Server => Step::AwaitLogin,
            };
            tracing::debug!(role = ?self.role, fingerprint = ?self.fingerprint(), "channel keyed");
        }
        Ok(())
    }

    fn send_login(&mut self) -> Result<()> {
        if self.username.is_none() || self.password.is_none() {
            return Err(self.suspend(ResourceKind::Password));
        }
        let (Some(username), Some(password)) = (self.username.clone(), self.password.take()) else {
            return Err(bad("login credentials vanished"));
        };
        self.exchange.satisfy();
        let mut login = Zeroizing::new(Vec::with_capacity(1 + username.len() + password.len()));
        // Usernames are validated to at most 255 bytes.
        login.push(username.len() as u8);
        login.extend_from_slice(username.as_bytes());
        login.extend_from_slice(password.as_bytes());
        self.queue_sealed(RecordType::AuthRequest, &login)?;
        self.step = Step::AwaitVerdict;
        tracing::debug!(%username, "login sent");
        Ok(())
    }

    fn await_verdict(&mut self) -> Result<()> {
        let record = self.expect(RecordType::AuthResponse)?;
        let verdict = self.noise_mut()?.decrypt(record.payload())?;
        match verdict.as_slice() {
            [VERDICT_APPROVED] => {
                self.peer_identity = self.username.clone();
                self.establish();
                Ok(())
            }
            [VERDICT_DENIED] => {
                self.step = Step::SendLogin;
                self.suspend(ResourceKind::Password);
                tracing::debug!("login denied");
                Err(Error::with_detail(Status::WrongKey, "login denied; supply other credentials"))
            }
            [VERDICT_REFUSED] => Err(self.fail(Error::with_detail(
                Status::WrongKey,
                "login denied and no attempts remain",
            ))),
            _ => Err(malformed("malformed login verdict")),
        }
    }

    fn await_login(&mut self) -> Result<()> {
        let record = self.expect(RecordType::AuthRequest)?;
        let login = self.noise_mut()?.decrypt(record.payload())?;
        let Some((&name_len, rest)) = login.split_first() else {
            return Err(malformed("malformed login"));
        };
        let name_len = usize::from(name_len);
        if name_len == 0 || rest.len() < name_len {
            return Err(malformed("malformed login"));
        }
        let username = std::str::from_utf8(&rest[..name_len])
            .map_err(|_| malformed("username is not UTF-8"))?
            .to_owned();
        let password = std::str::from_utf8(&rest[name_len..])
            .map_err(|_| malformed("password is not UTF-8"))?;
        tracing::debug!(%username, "login received");
        self.login = Some(Login {
            username,
            password: Zeroizing::new(password.to_owned()),
        });
        self.decision = None;
        self.step = Step::Decide;
        Ok(())
    }

    fn check_login(&self, keyset: &dyn CredentialLookup) -> Result<bool> {
        let Some(login) = &self.login else {
            return Err(bad("no login to check"));
        };
        match keyset.lookup(ResourceKind::Password, login.username.as_bytes()) {
            Ok(Credential::Password(expected)) => {
                Ok(bool::from(expected.as_bytes().ct_eq(login.password.as_bytes())))
            }
            Ok(_) => Ok(false),
            Err(err) if err.status() == Status::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn decide(&mut self) -> Result<()> {
        let approved = match self.decision.take() {
            Some(decision) => decision,
            None => {
                let keyset = if self.manual_auth { None } else { self.keyset.clone() };
                match keyset {
                    Some(keyset) => self.check_login(keyset.as_ref())?,
                    None => return Err(self.suspend(ResourceKind::Authorization)),
                }
            }
        };
        let approved = approved && !self.faults.trip(FaultKind::DenyAuth);
        self.exchange.satisfy();
        let username = self.login.take().map(|login| login.username);

        if approved {
            self.queue_sealed(RecordType::AuthResponse, &[VERDICT_APPROVED])?;
            self.peer_identity = username;
            self.establish();
            return Ok(());
        }

        self.attempts += 1;
        tracing::debug!(username = ?username, attempts = self.attempts, "login denied");
        if self.attempts >= self.auth_retry_limit {
            self.queue_sealed(RecordType::AuthResponse, &[VERDICT_REFUSED])?;
            // Best effort: the failure below is what the caller sees.
            let _ = self.write_pending();
            return Err(self.fail(Error::with_detail(
                Status::WrongKey,
                "login attempts exhausted",
            )));
        }
        self.queue_sealed(RecordType::AuthResponse, &[VERDICT_DENIED])?;
        self.step = Step::AwaitLogin;
        Ok(())
    }

    fn establish(&mut self) {
        self.state = SessionState::Established;
        self.step = Step::Done;
        tracing::debug!(role = ?self.role, peer = ?self.peer_identity, "session established");
    }

    // Data channel

    /// Seal buffered plaintext into data records and send them.
    fn seal_pending(&mut self) -> Result<()> {
        while !self.send_buf.is_empty() {
            let take = self.send_buf.len().min(MAX_PLAINTEXT_LENGTH);
            let chunk = Zeroizing::new(self.send_buf.peek()[..take].to_vec());
            self.queue_sealed(RecordType::Data, &chunk)?;
            self.send_buf.consume(take);
        }
        self.write_pending()
    }

    /// Read one record in the established state. Returns false once the
    /// channel is closed.
    fn receive_data(&mut self) -> Result<bool> {
        self.write_pending()?;
        let Some(record) = self.receive()? else {
            tracing::debug!("peer went away");
            self.state = SessionState::Closed;
            return Ok(false);
        };
        match record.kind() {
            RecordType::Data => {
                let mut ciphertext = record.payload().to_vec();
                if !ciphertext.is_empty() && self.faults.trip(FaultKind::CorruptPayload) {
                    ciphertext[0] ^= 0x01;
                }
                let plain = self.noise_mut()?.decrypt(&ciphertext)?;
                if !plain.is_empty() {
                    self.received.push_back(plain);
                }
                Ok(true)
            }
            RecordType::Close => {
                tracing::debug!("peer closed the session");
                self.state = SessionState::Closed;
                if let Some(noise) = &mut self.noise {
                    noise.terminate();
                }
                Ok(false)
            }
            _ => Err(malformed("unexpected record on an established session")),
        }
    }

    fn drain(&mut self, out: &mut [u8]) -> usize {
        let mut n = 0;
        while n < out.len() {
            let Some(chunk) = self.received.front_mut() else {
                break;
            };
            let take = chunk.len().min(out.len() - n);
            out[n..n + take].copy_from_slice(&chunk[..take]);
            n += take;
            if take == chunk.len() {
                self.received.pop_front();
            } else {
                chunk.copy_within(take.., 0);
                let keep = chunk.len() - take;
                chunk[keep..].zeroize();
                chunk.truncate(keep);
            }
        }
        n
    }

    /// Send a Close record and stop.
    pub fn close(&mut self) -> Result<()> {
        self.fail_if_faulted()?;
        if self.state != SessionState::Established {
            return Err(bad("session is not established"));
        }
        let result = self.seal_pending().and_then(|()| {
            self.outgoing.extend_from_slice(&Record::close().to_wire());
            self.write_pending()
        });
        self.state = SessionState::Closed;
        if let Some(noise) = &mut self.noise {
            noise.terminate();
        }
        self.settle(result)
    }

    /// Close if established, then wipe all key material and buffers.
    pub fn destroy(self) {
        drop(self);
    }

    fn wipe(&mut self) {
        if let Some(noise) = &mut self.noise {
            noise.terminate();
        }
        self.noise = None;
        self.static_key = None;
        self.keyset = None;
        self.password = None;
        self.login = None;
        self.incoming.wipe();
        self.send_buf.wipe();
        self.outgoing.zeroize();
        self.received.clear();
        self.prologue.clear();
    }
}

impl Transform for Session {
    fn push(&mut self, data: &[u8]) -> Result<usize> {
        self.fail_if_faulted()?;
        if self.state == SessionState::Closed {
            return Err(Error::new(Status::Complete));
        }
        if data.is_empty() {
            return self.flush().map(|()| 0);
        }
        let mut consumed = self.send_buf.write_some(data);
        if consumed < data.len() && self.state == SessionState::Established {
            let sealed = self.seal_pending();
            self.settle(sealed).map_err(|err| err.consumed_bytes(consumed))?;
            consumed += self.send_buf.write_some(&data[consumed..]);
        }
        if consumed < data.len() {
            return Err(Error::with_detail(Status::Overflow, "send buffer full; flush first")
                .consumed_bytes(consumed));
        }
        Ok(consumed)
    }

    fn flush(&mut self) -> Result<()> {
        self.fail_if_faulted()?;
        if self.state == SessionState::Closed {
            return Err(Error::new(Status::Complete));
        }
        if !self.activated {
            return Err(bad("session not active"));
        }
        let result = self.drive().and_then(|()| self.seal_pending());
        self.settle(result)
    }

    fn pop(&mut self, out: &mut [u8]) -> Result<usize> {
        if let Some(err) = &self.fault {
            // Records are authenticated one by one, so what was already
            // received can still be handed out.
            let err = err.clone();
            let n = self.drain(out);
            return if n > 0 { Ok(n) } else { Err(err) };
        }
        let mut n = self.drain(out);
        if n == out.len() || !self.activated || self.state == SessionState::Closed {
            return Ok(n);
        }
        if self.state != SessionState::Established {
            match self.drive() {
                Ok(()) => {}
                Err(err) if err.status() == Status::Timeout => return Ok(n),
                Err(err) => return self.settle(Err(err)),
            }
        }
        while n < out.len() {
            match self.receive_data() {
                Ok(true) => {
                    n += self.drain(&mut out[n..]);
                    // Another read would wait out the transport deadline.
                    if n > 0 && !record::record_ready(&self.incoming) {
                        break;
                    }
                }
                Ok(false) => break,
                Err(err) if err.status() == Status::Timeout && n > 0 => break,
                Err(err) => {
                    let result = self.settle(Err(err));
                    return if n > 0 { Ok(n) } else { result };
                }
            }
        }
        Ok(n)
    }

    fn required_resource(&self) -> Option<ResourceKind> {
        self.exchange.pending().map(|request| request.kind)
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

impl AttributeSource for Session {
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
        Some(&*self.faults)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Established {
            self.outgoing.extend_from_slice(&Record::close().to_wire());
            // Nothing can be reported from a destructor.
            let _ = self.write_pending();
        }
        self.wipe();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("version", &self.version)
            .finish()
    }
}
