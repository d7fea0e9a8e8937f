//! Transport errors.

use sealwire_core::{ResourceKind, Status};

/// Errors from connecting and driving a channel.
///
/// Apart from `Timeout` on `recv`, every error leaves the channel unusable:
/// the session underneath has already wiped its keys.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    // --- Connection & Setup ---
    /// Could not open the TCP connection.
    #[error("connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// Address that was dialled.
        address: String,
        /// What went wrong.
        reason: String,
    },
    /// Socket setup failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    /// The handshake or a receive did not finish in time.
    #[error("operation timed out")]
    Timeout,

    // --- Handshake ---
    /// The session asked for a credential the caller could not provide.
    #[error("no {0:?} available for the session")]
    CredentialUnavailable(ResourceKind),

    // --- Engine ---
    /// Engine failure, with its status and extended description.
    #[error("engine error: {0}")]
    Engine(#[from] sealwire_core::Error),

    // --- Lifecycle ---
    /// Peer closed the channel.
    #[error("peer closed the channel")]
    PeerClosed,
}

impl TransportError {
    /// Engine status behind this error, if it came from the engine.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Engine(err) => Some(err.status()),
            Self::Timeout => Some(Status::Timeout),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_status_is_exposed() {
        let err: TransportError =
            sealwire_core::Error::with_detail(Status::WrongKey, "login refused").into();
        assert_eq!(err.status(), Some(Status::WrongKey));
        assert!(err.to_string().contains("login refused"));
        assert_eq!(TransportError::PeerClosed.status(), None);
    }
}
