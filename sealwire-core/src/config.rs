//! Engine defaults loaded from TOML.
//!
//! Every field has a default, so an empty document is a valid
//! configuration. Values become the initial attributes of each object a
//! [`Context`](crate::Context) creates; objects can still override them
//! through attribute setters.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attribute::Attribute;
use crate::crypto::Prf;

/// Default I/O buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
/// Default plaintext bytes per segment.
pub const DEFAULT_SEGMENT_SIZE: usize = 4096;
/// Default PBKDF2 iteration count.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;
/// Default number of logins a server accepts before giving up.
pub const DEFAULT_AUTH_RETRY_LIMIT: u32 = 3;
/// Default transport deadline.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Default cap on recipient and signer records per envelope.
pub const DEFAULT_MAX_RECORDS: usize = 16;

/// Engine-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Capacity of each object's input and output buffer.
    pub buffer_size: usize,
    /// Plaintext bytes per envelope segment.
    pub segment_size: usize,
    /// PBKDF2 iterations for new password recipients.
    pub kdf_iterations: u32,
    /// PRF for new password recipients: `"hmac-sha256"` or `"hmac-sha512"`.
    pub kdf_prf: PrfName,
    /// Failed logins a server accepts.
    pub auth_retry_limit: u32,
    /// Transport read deadline.
    pub read_timeout_ms: u64,
    /// Transport write deadline.
    pub write_timeout_ms: u64,
    /// Recipient and signer records accepted per envelope header.
    pub max_records: usize,
}

/// Serialized name of a password PRF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PrfName {
    /// HMAC-SHA-256.
    #[default]
    HmacSha256,
    /// HMAC-SHA-512.
    HmacSha512,
}

impl From<PrfName> for Prf {
    fn from(name: PrfName) -> Self {
        match name {
            PrfName::HmacSha256 => Prf::HmacSha256,
            PrfName::HmacSha512 => Prf::HmacSha512,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            segment_size: DEFAULT_SEGMENT_SIZE,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            kdf_prf: PrfName::default(),
            auth_retry_limit: DEFAULT_AUTH_RETRY_LIMIT,
            read_timeout_ms: DEFAULT_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}

fn check(attr: Attribute, value: u64, name: &str) -> Result<(), ConfigError> {
    let value = i64::try_from(value).map_err(|_| ConfigError::Validation(format!("{name} is too large")))?;
    attr.validate_numeric(value)
        .map_err(|_| ConfigError::Validation(format!("{name} = {value} is out of range")))
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check every value against the attribute it seeds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(Attribute::BufferSize, self.buffer_size as u64, "buffer_size")?;
        check(Attribute::SegmentSize, self.segment_size as u64, "segment_size")?;
        check(Attribute::KdfIterations, u64::from(self.kdf_iterations), "kdf_iterations")?;
        check(Attribute::AuthRetryLimit, u64::from(self.auth_retry_limit), "auth_retry_limit")?;
        check(Attribute::ReadTimeout, self.read_timeout_ms, "read_timeout_ms")?;
        check(Attribute::WriteTimeout, self.write_timeout_ms, "write_timeout_ms")?;
        if self.segment_size * 2 > self.buffer_size {
            return Err(ConfigError::Validation(
                "segment_size must be at most half of buffer_size".to_string(),
            ));
        }
        if self.max_records == 0 || self.max_records > 255 {
            return Err(ConfigError::Validation(
                "max_records must be between 1 and 255".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.buffer_size, 32768);
        assert_eq!(config.kdf_iterations, 100_000);
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_toml(
            r#"
            buffer_size = 8192
            kdf_prf = "hmac-sha512"
            auth_retry_limit = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.kdf_prf, PrfName::HmacSha512);
        assert_eq!(config.auth_retry_limit, 5);
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = EngineConfig::from_toml("buffer_size = 100").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref msg) if msg.contains("buffer_size")));
        let err = EngineConfig::from_toml("buffer_size = 4096\nsegment_size = 4096").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_unknown_field_is_parse_error() {
        let err = EngineConfig::from_toml("bufer_size = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let config = EngineConfig {
            kdf_iterations: 1000,
            ..EngineConfig::default()
        };
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();
        let loaded = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
