//! Algorithm and protocol-version registry.
//!
//! One registry is built per [`Context`](crate::Context) and shared
//! read-only by every object created from it. Session negotiation and
//! envelope parsing consult it instead of hard-coded tables.

use std::ops::RangeInclusive;

use crate::crypto::Prf;

/// Lowest protocol version this build speaks.
pub const MIN_VERSION: u8 = 1;
/// Highest protocol version this build speaks.
pub const MAX_VERSION: u8 = 2;

/// A Noise handshake suite offered during session negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoiseSuite {
    /// Wire identifier.
    pub id: u8,
    /// Noise protocol name handed to snow.
    pub pattern: &'static str,
}

/// Compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    /// Zstandard, one frame per segment.
    Zstd = 1,
}

impl Compression {
    /// Parse from the wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Zstd),
            _ => None,
        }
    }
}

const BUILTIN_SUITES: [NoiseSuite; 2] = [
    NoiseSuite {
        id: 1,
        pattern: "Noise_XX_25519_ChaChaPoly_BLAKE2s",
    },
    NoiseSuite {
        id: 2,
        pattern: "Noise_XX_25519_ChaChaPoly_SHA256",
    },
];

/// Capability tables.
#[derive(Debug, Clone)]
pub struct Registry {
    versions: RangeInclusive<u8>,
    suites: Vec<NoiseSuite>,
    prfs: Vec<Prf>,
    compression: Vec<Compression>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    /// Everything this build supports, in preference order.
    pub fn builtin() -> Self {
        Self {
            versions: MIN_VERSION..=MAX_VERSION,
            suites: BUILTIN_SUITES.to_vec(),
            prfs: vec![Prf::HmacSha256, Prf::HmacSha512],
            compression: vec![Compression::Zstd],
        }
    }

    /// Restrict the accepted version range. The range is clamped to what
    /// this build speaks; an empty intersection leaves the registry with no
    /// usable version.
    pub fn with_versions(mut self, min: u8, max: u8) -> Self {
        let min = min.max(MIN_VERSION);
        let max = max.min(MAX_VERSION);
        self.versions = min..=max;
        self
    }

    /// Restrict the offered suites to the given ids, keeping builtin order.
    pub fn with_suites(mut self, ids: &[u8]) -> Self {
        self.suites.retain(|suite| ids.contains(&suite.id));
        self
    }

    /// Lowest accepted version.
    pub fn min_version(&self) -> u8 {
        *self.versions.start()
    }

    /// Highest accepted version.
    pub fn max_version(&self) -> u8 {
        *self.versions.end()
    }

    /// Whether `version` is accepted.
    pub fn supports_version(&self, version: u8) -> bool {
        self.versions.contains(&version)
    }

    /// Highest version both sides speak, if any.
    pub fn negotiate_version(&self, peer_max: u8) -> Option<u8> {
        let version = peer_max.min(self.max_version());
        self.supports_version(version).then_some(version)
    }

    /// Suites in preference order.
    pub fn suites(&self) -> &[NoiseSuite] {
        &self.suites
    }

    /// Look up a suite by id.
    pub fn suite(&self, id: u8) -> Option<NoiseSuite> {
        self.suites.iter().copied().find(|suite| suite.id == id)
    }

    /// First of our suites that the peer also offered.
    pub fn select_suite(&self, offered: &[u8]) -> Option<NoiseSuite> {
        self.suites
            .iter()
            .copied()
            .find(|suite| offered.contains(&suite.id))
    }

    /// Whether the password PRF is accepted.
    pub fn supports_prf(&self, prf: Prf) -> bool {
        self.prfs.contains(&prf)
    }

    /// Whether the compression algorithm is available.
    pub fn supports_compression(&self, algorithm: Compression) -> bool {
        self.compression.contains(&algorithm)
    }
}
