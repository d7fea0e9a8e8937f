//! Sealwire engine core
//!
//! Resumable streaming engine for cryptographic sessions and envelopes.
//!
//! This crate provides:
//! - A push/flush/pop façade shared by every object
//! - Envelope wrap and unwrap state machines (password, public-key and
//!   session-key recipients, signatures, compression)
//! - Client and server session handshakes over any byte transport
//! - A credential exchange that suspends an object until the caller
//!   supplies what it needs, then resumes where it stopped
//!
//! # Failure semantics
//!
//! - Recoverable statuses (`Overflow`, `Underflow`, `Timeout`,
//!   `ResourceNeeded`, `NotFound`, `WrongKey` while candidates remain)
//!   leave the object usable
//! - Anything else is sticky: the object reports it on every later call
//! - Direct use of `unsafe` is forbidden (#![forbid(unsafe_code)])
//! - Key material and buffered plaintext are wiped on destroy

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod attribute;
pub mod buffer;
pub mod config;
pub mod context;
pub mod credential;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod fault;
pub mod object;
pub mod pool;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;

pub use attribute::{Attribute, AttributeClass, ContentType, Handle};
pub use buffer::{AttributeSource, DynBuf};
pub use config::{ConfigError, EngineConfig};
pub use context::Context;
pub use credential::{Credential, CredentialLookup, Keyset, ResourceKind};
pub use crypto::{PrivateKey, PublicKey, SessionKey, SigningKey, VerifyKey};
pub use envelope::{Envelope, EnvelopeMode, EnvelopeState};
pub use error::{Error, Result, Status};
pub use fault::{FaultController, FaultKind};
pub use object::{CryptObject, ObjectKind};
pub use pool::{PoolBlock, ResourcePool};
pub use registry::Registry;
pub use session::{Role, Session, SessionState};
pub use stream::{StreamBuffer, Transform};
pub use transport::{MemoryTransport, Transport};
