//! Noise_XX handshake wrapper.
//!
//! Wraps `snow` with the negotiated suite. Both hello records are fed in
//! as the prologue, so a tampered negotiation fails the handshake. Any
//! handshake error is terminal.

use sha2::{Digest, Sha256};
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, TransportState};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{PrivateKey, PUBLIC_KEY_SIZE, TAG_SIZE};
use crate::error::{Error, Result, Status};
use crate::registry::NoiseSuite;

use super::record::MAX_WIRE_LENGTH;

/// Noise messages never exceed a record body.
const MAX_NOISE_MSG_SIZE: usize = MAX_WIRE_LENGTH;

fn noise_failure(err: snow::Error, what: &str) -> Error {
    let status = match err {
        snow::Error::Decrypt => Status::Signature,
        _ => Status::BadData,
    };
    Error::with_detail(status, format!("{what} failed"))
}

enum NoiseState {
    Handshake(Box<HandshakeState>),
    Transport(Box<TransportState>),
    Terminated,
}

/// Noise state for one session.
pub(crate) struct NoiseSession {
    state: NoiseState,
    local_public: [u8; PUBLIC_KEY_SIZE],
    peer_public: Option<[u8; PUBLIC_KEY_SIZE]>,
}

impl NoiseSession {
    /// Start a handshake with `local` as the static key.
    pub(crate) fn new(
        initiator: bool,
        suite: NoiseSuite,
        local: &PrivateKey,
        prologue: &[u8],
    ) -> Result<Self> {
        let params = suite
            .pattern
            .parse::<NoiseParams>()
            .map_err(|_| Error::with_detail(Status::BadParam, "unsupported noise suite"))?;
        let secret = local.secret_bytes();
        let builder = Builder::new(params)
            .local_private_key(&secret[..])
            .prologue(prologue);
        let handshake = if initiator {
            builder.build_initiator()
        } else {
            builder.build_responder()
        }
        .map_err(|_| Error::with_detail(Status::BadParam, "noise setup failed"))?;

        Ok(Self {
            state: NoiseState::Handshake(Box::new(handshake)),
            local_public: local.public_key().to_bytes(),
            peer_public: None,
        })
    }

    pub(crate) fn is_handshake_complete(&self) -> bool {
        matches!(self.state, NoiseState::Transport(_))
    }

    pub(crate) fn is_my_turn(&self) -> bool {
        match &self.state {
            NoiseState::Handshake(hs) => hs.is_my_turn(),
            NoiseState::Transport(_) => true,
            NoiseState::Terminated => false,
        }
    }

    pub(crate) fn peer_public_key(&self) -> Option<&[u8; PUBLIC_KEY_SIZE]> {
        self.peer_public.as_ref()
    }

    fn handshake(&mut self) -> Result<&mut HandshakeState> {
        match &mut self.state {
            NoiseState::Handshake(hs) => Ok(&mut **hs),
            NoiseState::Transport(_) => Err(Error::with_detail(Status::BadData, "handshake already complete")),
            NoiseState::Terminated => Err(Error::with_detail(Status::BadParam, "session terminated")),
        }
    }

    fn transport(&mut self) -> Result<&mut TransportState> {
        match &mut self.state {
            NoiseState::Transport(t) => Ok(&mut **t),
            NoiseState::Handshake(_) => Err(Error::with_detail(Status::BadData, "handshake not complete")),
            NoiseState::Terminated => Err(Error::with_detail(Status::BadParam, "session terminated")),
        }
    }

    /// Produce our next handshake message.
    pub(crate) fn write_handshake(&mut self) -> Result<Vec<u8>> {
        let hs = self.handshake()?;
        if !hs.is_my_turn() {
            return Err(Error::with_detail(Status::BadData, "not our handshake turn"));
        }
        let mut buf = vec![0u8; MAX_NOISE_MSG_SIZE];
        let len = hs
            .write_message(&[], &mut buf)
            .map_err(|err| noise_failure(err, "handshake write"))?;
        buf.truncate(len);
        self.maybe_transition_to_transport()?;
        Ok(buf)
    }

    /// Consume the peer's handshake message.
    pub(crate) fn read_handshake(&mut self, message: &[u8]) -> Result<()> {
        let hs = self.handshake()?;
        if hs.is_my_turn() {
            return Err(Error::with_detail(Status::BadData, "unexpected handshake message"));
        }
        let mut buf = vec![0u8; MAX_NOISE_MSG_SIZE];
        hs.read_message(message, &mut buf)
            .map_err(|err| noise_failure(err, "handshake read"))?;
        buf.zeroize();
        self.maybe_transition_to_transport()
    }

    fn maybe_transition_to_transport(&mut self) -> Result<()> {
        let finished = match &self.state {
            NoiseState::Handshake(hs) => hs.is_handshake_finished(),
            _ => return Ok(()),
        };
        if !finished {
            return Ok(());
        }
        let NoiseState::Handshake(hs) = std::mem::replace(&mut self.state, NoiseState::Terminated) else {
            return Ok(());
        };
        if let Some(key) = hs.get_remote_static() {
            let mut peer = [0u8; PUBLIC_KEY_SIZE];
            peer.copy_from_slice(&key[..PUBLIC_KEY_SIZE]);
            self.peer_public = Some(peer);
        }
        let transport = (*hs)
            .into_transport_mode()
            .map_err(|err| noise_failure(err, "transport switch"))?;
        self.state = NoiseState::Transport(Box::new(transport));
        Ok(())
    }

    /// Encrypt one transport message.
    pub(crate) fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let transport = self.transport()?;
        let mut buf = vec![0u8; plaintext.len() + TAG_SIZE];
        let len = transport
            .write_message(plaintext, &mut buf)
            .map_err(|err| noise_failure(err, "encrypt"))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Decrypt one transport message. Authentication failures are
    /// `Signature`.
    pub(crate) fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let transport = self.transport()?;
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::with_detail(Status::BadData, "ciphertext shorter than tag"));
        }
        let mut buf = Zeroizing::new(vec![0u8; ciphertext.len()]);
        let len = transport
            .read_message(ciphertext, &mut buf)
            .map_err(|err| noise_failure(err, "decrypt"))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Drop all key material.
    pub(crate) fn terminate(&mut self) {
        self.state = NoiseState::Terminated;
        self.peer_public = None;
    }

    pub(crate) fn is_terminated(&self) -> bool {
        matches!(self.state, NoiseState::Terminated)
    }

    /// Hex SHA-256 prefix of the peer's static key.
    pub(crate) fn fingerprint(&self) -> Option<String> {
        let peer = self.peer_public.as_ref()?;
        Some(hex::encode(&Sha256::digest(peer)[..16]))
    }

    /// Hex SHA-256 prefix of our static key, as the peer will see it.
    pub(crate) fn local_fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.local_public)[..16])
    }
}

impl Drop for NoiseSession {
    fn drop(&mut self) {
        if !self.is_terminated() {
            self.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn pair(prologue_a: &[u8], prologue_b: &[u8]) -> (NoiseSession, NoiseSession, PrivateKey) {
        let suite = Registry::builtin().suites()[0];
        let server_key = PrivateKey::generate();
        let client = NoiseSession::new(true, suite, &PrivateKey::generate(), prologue_a).unwrap();
        let server = NoiseSession::new(false, suite, &server_key, prologue_b).unwrap();
        (client, server, server_key)
    }

    #[test]
    fn test_full_handshake() {
        let (mut client, mut server, server_key) = pair(b"hello", b"hello");
        assert!(client.is_my_turn());
        let msg1 = client.write_handshake().unwrap();
        server.read_handshake(&msg1).unwrap();
        let msg2 = server.write_handshake().unwrap();
        client.read_handshake(&msg2).unwrap();
        let msg3 = client.write_handshake().unwrap();
        server.read_handshake(&msg3).unwrap();

        assert!(client.is_handshake_complete());
        assert!(server.is_handshake_complete());
        assert_eq!(client.peer_public_key(), Some(&server_key.public_key().to_bytes()));
        assert_eq!(client.fingerprint(), Some(server.local_fingerprint()));

        let ciphertext = client.encrypt(b"over the channel").unwrap();
        assert_eq!(&server.decrypt(&ciphertext).unwrap()[..], b"over the channel");
    }

    #[test]
    fn test_prologue_mismatch_fails() {
        let (mut client, mut server, _) = pair(b"offer-a", b"offer-b");
        let msg1 = client.write_handshake().unwrap();
        server.read_handshake(&msg1).unwrap();
        let msg2 = server.write_handshake().unwrap();
        assert!(client.read_handshake(&msg2).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (mut client, mut server, _) = pair(b"", b"");
        let msg1 = client.write_handshake().unwrap();
        server.read_handshake(&msg1).unwrap();
        client.read_handshake(&server.write_handshake().unwrap()).unwrap();
        server.read_handshake(&client.write_handshake().unwrap()).unwrap();

        let mut ciphertext = client.encrypt(b"secret").unwrap();
        ciphertext[0] ^= 0xFF;
        assert_eq!(server.decrypt(&ciphertext).unwrap_err().status(), Status::Signature);
    }

    #[test]
    fn test_terminate_prevents_use() {
        let (mut client, _, _) = pair(b"", b"");
        client.terminate();
        assert!(client.is_terminated());
        assert!(client.write_handshake().is_err());
    }
}
