//! Blocking secure channel over TCP.
//!
//! A [`SecureChannel`] owns a session and drives it until it is
//! established: socket timeouts are retried until the handshake deadline,
//! and credential requests are answered by a [`CredentialSource`].
//!
//! # Hard failures
//!
//! - Any non-recoverable engine status ends the channel; the session has
//!   already wiped its keys by the time the error is returned
//! - `SecureChannel` is not `Clone`
//! - Dropping a channel sends a close record if the session is still up

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Instant;

use sealwire_core::{
    Attribute, Context, Error, Handle, PrivateKey, ResourceKind, Role, Session, SessionState,
    Status, Transform,
};
use zeroize::Zeroizing;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::message::Message;
use crate::tcp::TcpTransport;

/// Largest plaintext handed out by one `recv`.
const RECV_CHUNK: usize = 16 * 1024;

/// Answers a session's credential requests.
///
/// `supply` sets the attribute matching `kind` on the session, which
/// resumes the handshake, and returns whatever that call returned.
/// Return a `NotFound` error when there is nothing to give.
pub trait CredentialSource {
    /// Provide `kind` to `session`.
    fn supply(&mut self, session: &mut Session, kind: ResourceKind) -> sealwire_core::Result<()>;
}

impl<F> CredentialSource for F
where
    F: FnMut(&mut Session, ResourceKind) -> sealwire_core::Result<()>,
{
    fn supply(&mut self, session: &mut Session, kind: ResourceKind) -> sealwire_core::Result<()> {
        self(session, kind)
    }
}

/// Source with nothing to give.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialSource for NoCredentials {
    fn supply(&mut self, _session: &mut Session, kind: ResourceKind) -> sealwire_core::Result<()> {
        Err(Error::with_detail(Status::NotFound, format!("no {kind:?} configured")))
    }
}

/// Fixed client login.
pub struct Login {
    username: String,
    password: Zeroizing<String>,
}

impl Login {
    /// Login as `username` with `password`.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }
}

impl std::fmt::Debug for Login {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Login")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl CredentialSource for Login {
    fn supply(&mut self, session: &mut Session, kind: ResourceKind) -> sealwire_core::Result<()> {
        if kind != ResourceKind::Password {
            return NoCredentials.supply(session, kind);
        }
        session.set_string(Attribute::Username, &self.username)?;
        session.set_string(Attribute::Password, &self.password)
    }
}

/// An established session over TCP.
#[derive(Debug)]
pub struct SecureChannel {
    session: Session,
    config: TransportConfig,
}

impl SecureChannel {
    /// Connect to `config.address` and run the client handshake.
    pub fn connect(
        ctx: &Context,
        config: &TransportConfig,
        credentials: &mut dyn CredentialSource,
    ) -> Result<Self, TransportError> {
        let transport = TcpTransport::connect(config)?;
        let session = ctx.create_session(Role::Client, transport)?;
        Self::establish(session, config, credentials)
    }

    /// Run the server handshake on an accepted stream, authenticating with
    /// `key`. Logins are decided by `credentials` through `Authorization`
    /// requests; use [`SecureChannel::establish`] to check them against a
    /// keyset instead.
    pub fn accept(
        ctx: &Context,
        stream: TcpStream,
        config: &TransportConfig,
        key: Arc<PrivateKey>,
        credentials: &mut dyn CredentialSource,
    ) -> Result<Self, TransportError> {
        let transport = TcpTransport::from_stream(stream)?;
        let mut session = ctx.create_session(Role::Server, transport)?;
        session.set_handle(Attribute::PrivateKey, Handle::PrivateKey(key))?;
        Self::establish(session, config, credentials)
    }

    /// Activate a prepared session and drive it until it is established.
    pub fn establish(
        mut session: Session,
        config: &TransportConfig,
        credentials: &mut dyn CredentialSource,
    ) -> Result<Self, TransportError> {
        session.set_numeric(Attribute::ReadTimeout, config.io_timeout_ms())?;
        session.set_numeric(Attribute::WriteTimeout, config.io_timeout_ms())?;

        let deadline = Instant::now() + config.handshake_timeout;
        let mut step = session.set_numeric(Attribute::Active, 1);
        loop {
            match session.state() {
                SessionState::Established => break,
                SessionState::Failed(status) => return Err(failure(&session, status)),
                SessionState::Closed => return Err(TransportError::PeerClosed),
                _ => {}
            }
            if let Err(err) = &step {
                if !err.is_recoverable() {
                    return Err(TransportError::Engine(err.clone()));
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!(role = ?session.role(), "handshake deadline passed");
                return Err(TransportError::Timeout);
            }
            step = match session.required_resource() {
                Some(kind) => {
                    tracing::debug!(role = ?session.role(), ?kind, "credential requested");
                    let result = credentials.supply(&mut session, kind);
                    if matches!(&result, Err(err) if err.status() == Status::NotFound) {
                        return Err(TransportError::CredentialUnavailable(kind));
                    }
                    result
                }
                None => session.flush(),
            };
        }

        tracing::info!(
            role = ?session.role(),
            peer = session.peer_identity().unwrap_or("-"),
            version = session.version(),
            "channel established"
        );
        Ok(Self {
            session,
            config: config.clone(),
        })
    }

    /// Seal and send `data`.
    pub fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut rest = data;
        while !rest.is_empty() {
            match self.session.push(rest) {
                Ok(n) => rest = &rest[n..],
                Err(err) if matches!(err.status(), Status::Overflow | Status::Timeout) => {
                    rest = &rest[err.consumed()..];
                    self.flush()?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.flush()
    }

    /// Wait for plaintext from the peer.
    ///
    /// Returns what has arrived, up to 16 KiB, without regard to how the
    /// peer split its sends. `PeerClosed` once the peer has closed and
    /// everything it sent has been returned.
    pub fn recv(&mut self) -> Result<Message, TransportError> {
        let deadline = self.config.recv_timeout.map(|timeout| Instant::now() + timeout);
        let mut buf = Zeroizing::new(vec![0u8; RECV_CHUNK]);
        loop {
            match self.session.pop(&mut buf) {
                Ok(0) if self.session.state() == SessionState::Closed => {
                    return Err(TransportError::PeerClosed)
                }
                Ok(0) => {}
                Ok(n) => return Ok(Message::new(buf[..n].to_vec())),
                Err(err) if err.status() == Status::Timeout => {}
                Err(err) => return Err(err.into()),
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(TransportError::Timeout);
            }
        }
    }

    /// Send a close record, unless the peer already closed, and destroy
    /// the session.
    pub fn close(self) -> Result<(), TransportError> {
        let mut session = self.session;
        let result = match session.state() {
            SessionState::Established => session.close(),
            _ => Ok(()),
        };
        session.destroy();
        result.map_err(TransportError::from)
    }

    /// Approved login identity.
    pub fn peer_identity(&self) -> Option<&str> {
        self.session.peer_identity()
    }

    /// Fingerprint of the server's static key.
    pub fn fingerprint(&self) -> Option<String> {
        self.session.fingerprint()
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> Option<u8> {
        self.session.version()
    }

    /// The session underneath.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Push sealed records out, retrying socket timeouts until the
    /// handshake deadline.
    fn flush(&mut self) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            match self.session.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.status() == Status::Timeout && Instant::now() < deadline => {}
                Err(err) if err.status() == Status::Timeout => return Err(TransportError::Timeout),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn failure(session: &Session, status: Status) -> TransportError {
    let err = match session.last_error() {
        Some(detail) => Error::with_detail(status, detail),
        None => Error::new(status),
    };
    tracing::warn!(role = ?session.role(), error = %err, "handshake failed");
    TransportError::Engine(err)
}
