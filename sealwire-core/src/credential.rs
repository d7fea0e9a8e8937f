//! Credential exchange: suspension, candidates and retries.
//!
//! When an object cannot proceed without a secret it records a single
//! outstanding [`CredentialRequest`] and returns `ResourceNeeded`. The
//! caller supplies the credential through an attribute setter, which
//! resolves the request. Envelopes with several possible key holders expose
//! them as [`Candidate`]s; each failed attempt marks one candidate tried
//! and advances the cursor.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::crypto::{KeyId, PrivateKey, SessionKey, VerifyKey};
use crate::error::{Error, Result, Status};

/// Kinds of resource an object can suspend for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A password for a password-recipient record, or a client login.
    Password,
    /// A private key for a public-key recipient or a session server.
    PrivateKey,
    /// A pre-shared symmetric content key.
    SessionKey,
    /// A keyset to search for decryption keys.
    DecryptionKeyset,
    /// The verification key for a signed envelope.
    SignatureCheckKey,
    /// The content hash of a detached signature.
    DetachedHash,
    /// An approve/deny decision for a client login.
    Authorization,
}

/// A secret returned by a [`CredentialLookup`].
#[derive(Clone)]
pub enum Credential {
    /// Password text.
    Password(Zeroizing<String>),
    /// Private key.
    PrivateKey(Arc<PrivateKey>),
    /// Symmetric content key.
    SessionKey(Arc<SessionKey>),
    /// Verification key.
    SignatureCheckKey(Arc<VerifyKey>),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Credential::Password(..)"),
            Self::PrivateKey(key) => f.debug_tuple("Credential::PrivateKey").field(key).finish(),
            Self::SessionKey(key) => f.debug_tuple("Credential::SessionKey").field(key).finish(),
            Self::SignatureCheckKey(key) => {
                f.debug_tuple("Credential::SignatureCheckKey").field(key).finish()
            }
        }
    }
}

/// Source of credentials an object may query without suspending.
///
/// `id` is a key identifier for key lookups or a username for password
/// lookups. Implementations return `NotFound` when they hold nothing
/// matching.
pub trait CredentialLookup: Send + Sync {
    /// Find a credential of `kind`.
    fn lookup(&self, kind: ResourceKind, id: &[u8]) -> Result<Credential>;
}

/// In-memory keyset.
#[derive(Default)]
pub struct Keyset {
    private_keys: HashMap<KeyId, Arc<PrivateKey>>,
    session_keys: HashMap<KeyId, Arc<SessionKey>>,
    verify_keys: HashMap<KeyId, Arc<VerifyKey>>,
    passwords: HashMap<String, Zeroizing<String>>,
}

impl Keyset {
    /// Empty keyset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a decryption key, indexed by its public key id.
    pub fn add_private_key(&mut self, key: Arc<PrivateKey>) {
        self.private_keys.insert(key.key_id(), key);
    }

    /// Add a pre-shared content key.
    pub fn add_session_key(&mut self, key: Arc<SessionKey>) {
        self.session_keys.insert(key.key_id(), key);
    }

    /// Add a signature verification key.
    pub fn add_verify_key(&mut self, key: Arc<VerifyKey>) {
        self.verify_keys.insert(key.key_id(), key);
    }

    /// Add a login a session server will accept.
    pub fn add_user(&mut self, username: &str, password: &str) {
        self.passwords
            .insert(username.to_owned(), Zeroizing::new(password.to_owned()));
    }
}

impl fmt::Debug for Keyset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyset")
            .field("private_keys", &self.private_keys.len())
            .field("session_keys", &self.session_keys.len())
            .field("verify_keys", &self.verify_keys.len())
            .field("users", &self.passwords.len())
            .finish()
    }
}

fn key_id(id: &[u8]) -> Option<KeyId> {
    id.try_into().ok()
}

impl CredentialLookup for Keyset {
    fn lookup(&self, kind: ResourceKind, id: &[u8]) -> Result<Credential> {
        let found = match kind {
            ResourceKind::PrivateKey | ResourceKind::DecryptionKeyset => key_id(id)
                .and_then(|id| self.private_keys.get(&id))
                .map(|key| Credential::PrivateKey(Arc::clone(key))),
            ResourceKind::SessionKey => key_id(id)
                .and_then(|id| self.session_keys.get(&id))
                .map(|key| Credential::SessionKey(Arc::clone(key))),
            ResourceKind::SignatureCheckKey => key_id(id)
                .and_then(|id| self.verify_keys.get(&id))
                .map(|key| Credential::SignatureCheckKey(Arc::clone(key))),
            ResourceKind::Password | ResourceKind::Authorization => std::str::from_utf8(id)
                .ok()
                .and_then(|user| self.passwords.get(user))
                .map(|password| Credential::Password(password.clone())),
            ResourceKind::DetachedHash => None,
        };
        found.ok_or_else(|| Error::new(Status::NotFound))
    }
}

/// One possible key holder for an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    kind: ResourceKind,
    key_id: Option<KeyId>,
    tried: bool,
}

impl Candidate {
    /// Kind of credential that would satisfy this candidate.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Key identifier, for key candidates.
    pub fn key_id(&self) -> Option<KeyId> {
        self.key_id
    }

    /// Whether a failed attempt has already been charged to this candidate.
    pub fn tried(&self) -> bool {
        self.tried
    }
}

/// The single outstanding request of a suspended object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialRequest {
    /// What the object needs.
    pub kind: ResourceKind,
    /// Candidate the request refers to, if any.
    pub candidate: Option<usize>,
}

/// Outcome of charging a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Untried candidates remain; the caller may retry.
    Retry,
    /// Every candidate has been tried.
    Exhausted,
}

/// Per-object exchange state.
#[derive(Debug, Default)]
pub struct CredentialExchange {
    candidates: Vec<Candidate>,
    pending: Option<CredentialRequest>,
    cursor: usize,
}

impl CredentialExchange {
    /// Exchange with no candidates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a candidate; returns its index.
    pub fn add_candidate(&mut self, kind: ResourceKind, key_id: Option<KeyId>) -> usize {
        self.candidates.push(Candidate {
            kind,
            key_id,
            tried: false,
        });
        self.candidates.len() - 1
    }

    /// All candidates in record order.
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Index of the next candidate an attempt will be charged to.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The outstanding request, if suspended.
    pub fn pending(&self) -> Option<CredentialRequest> {
        self.pending
    }

    /// Whether any candidate is still untried.
    pub fn has_untried(&self) -> bool {
        self.candidates.iter().any(|c| !c.tried)
    }

    /// Kind of the first untried candidate.
    pub fn next_kind(&self) -> Option<ResourceKind> {
        self.candidates.iter().find(|c| !c.tried).map(|c| c.kind)
    }

    /// Record that the object needs `kind`. Replaces any previous request.
    pub fn suspend(&mut self, kind: ResourceKind) -> CredentialRequest {
        let candidate = self
            .candidates
            .iter()
            .position(|c| !c.tried && c.kind == kind);
        let request = CredentialRequest { kind, candidate };
        self.pending = Some(request);
        request
    }

    /// Clear the outstanding request.
    pub fn satisfy(&mut self) -> Option<CredentialRequest> {
        self.pending.take()
    }

    /// Charge a failed attempt of `kind`.
    ///
    /// The untried candidate of that kind with a matching key id is marked
    /// tried, falling back to the first untried candidate of that kind, and
    /// the cursor moves to the next untried one. Candidates of other kinds
    /// are never charged.
    pub fn record_failure(&mut self, kind: ResourceKind, key_id: Option<&KeyId>) -> Attempt {
        let slot = self
            .candidates
            .iter()
            .position(|c| {
                !c.tried && c.kind == kind && key_id.map_or(true, |id| c.key_id.as_ref() == Some(id))
            })
            .or_else(|| self.candidates.iter().position(|c| !c.tried && c.kind == kind));
        if let Some(index) = slot {
            self.candidates[index].tried = true;
        }
        self.cursor = self
            .candidates
            .iter()
            .position(|c| !c.tried)
            .unwrap_or(self.candidates.len());
        if self.has_untried() {
            Attempt::Retry
        } else {
            Attempt::Exhausted
        }
    }

    /// Forget candidates and any request.
    pub fn reset(&mut self) {
        self.candidates.clear();
        self.pending = None;
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspend_points_at_untried_candidate() {
        let mut exchange = CredentialExchange::new();
        exchange.add_candidate(ResourceKind::Password, None);
        exchange.add_candidate(ResourceKind::Password, None);
        let request = exchange.suspend(ResourceKind::Password);
        assert_eq!(request.candidate, Some(0));
        assert_eq!(exchange.record_failure(ResourceKind::Password, None), Attempt::Retry);
        assert_eq!(exchange.cursor(), 1);
        assert_eq!(exchange.suspend(ResourceKind::Password).candidate, Some(1));
        assert_eq!(
            exchange.record_failure(ResourceKind::Password, None),
            Attempt::Exhausted
        );
        assert_eq!(exchange.cursor(), 2);
    }

    #[test]
    fn test_failure_charges_matching_key_id() {
        let mut exchange = CredentialExchange::new();
        exchange.add_candidate(ResourceKind::PrivateKey, Some([1; 8]));
        exchange.add_candidate(ResourceKind::PrivateKey, Some([2; 8]));
        exchange.record_failure(ResourceKind::PrivateKey, Some(&[2; 8]));
        assert!(!exchange.candidates()[0].tried());
        assert!(exchange.candidates()[1].tried());
        assert_eq!(exchange.cursor(), 0);
    }

    #[test]
    fn test_unknown_key_id_charged_within_its_kind() {
        let mut exchange = CredentialExchange::new();
        exchange.add_candidate(ResourceKind::Password, None);
        exchange.add_candidate(ResourceKind::PrivateKey, Some([1; 8]));
        assert_eq!(
            exchange.record_failure(ResourceKind::PrivateKey, Some(&[9; 8])),
            Attempt::Retry
        );
        assert!(!exchange.candidates()[0].tried());
        assert!(exchange.candidates()[1].tried());
        assert_eq!(exchange.next_kind(), Some(ResourceKind::Password));
    }

    #[test]
    fn test_failure_never_charges_other_kinds() {
        let mut exchange = CredentialExchange::new();
        exchange.add_candidate(ResourceKind::Password, None);
        assert_eq!(
            exchange.record_failure(ResourceKind::PrivateKey, Some(&[1; 8])),
            Attempt::Retry
        );
        assert!(!exchange.candidates()[0].tried());
        assert_eq!(exchange.cursor(), 0);
    }

    #[test]
    fn test_single_pending_request() {
        let mut exchange = CredentialExchange::new();
        exchange.suspend(ResourceKind::Password);
        exchange.suspend(ResourceKind::SignatureCheckKey);
        assert_eq!(
            exchange.pending().map(|r| r.kind),
            Some(ResourceKind::SignatureCheckKey)
        );
        assert!(exchange.satisfy().is_some());
        assert!(exchange.pending().is_none());
    }

    #[test]
    fn test_keyset_lookup() {
        let mut keyset = Keyset::new();
        let key = Arc::new(PrivateKey::generate());
        keyset.add_private_key(Arc::clone(&key));
        keyset.add_user("alice", "pw");
        assert!(matches!(
            keyset.lookup(ResourceKind::PrivateKey, &key.key_id()),
            Ok(Credential::PrivateKey(_))
        ));
        assert!(matches!(
            keyset.lookup(ResourceKind::Password, b"alice"),
            Ok(Credential::Password(p)) if p.as_str() == "pw"
        ));
        let err = keyset.lookup(ResourceKind::Password, b"bob").unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }
}
