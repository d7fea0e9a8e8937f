//! Sealwire Transport
//!
//! Blocking TCP plumbing for `sealwire-core` sessions.
//!
//! This crate wraps the engine's session variant and provides a simple API
//! for running the handshake over a socket and exchanging data once it is
//! established.
//!
//! # Hard failures
//!
//! - Any non-recoverable engine status terminates the channel
//! - Socket deadlines are retried until the handshake deadline, then fail
//!   as `Timeout`
//! - Received plaintext is handed out as a zeroizing [`Message`]
//! - `SecureChannel` and `Message` do not implement `Clone`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod channel;
pub mod config;
pub mod error;
pub mod message;
pub mod tcp;

pub use channel::{CredentialSource, Login, NoCredentials, SecureChannel};
pub use config::TransportConfig;
pub use error::TransportError;
pub use message::Message;
pub use tcp::TcpTransport;
