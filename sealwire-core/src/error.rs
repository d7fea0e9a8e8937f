//! Status taxonomy and the error value returned by every engine call.
//!
//! Statuses are small integers: zero for success, a fixed negative range
//! for failures, and two special values. `ResourceNeeded` means the object
//! suspended waiting for a credential; `OkSpecial` means the operation
//! completed but left a residual condition the caller may inspect.

use std::fmt;

use thiserror::Error;

/// Numeric code for success.
pub const STATUS_OK: i32 = 0;

/// Status kinds.
///
/// Only the kinds reported by [`Status::is_recoverable`] leave the object
/// usable. Everything else is sticky once an object records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Status {
    /// Invalid attribute value or call sequence.
    #[error("bad parameter")]
    BadParam,
    /// Allocation failure.
    #[error("out of memory")]
    Memory,
    /// Credential supplied but incorrect, or candidates exhausted.
    #[error("wrong key")]
    WrongKey,
    /// Object is finalized and has no more data.
    #[error("complete")]
    Complete,
    /// Transport deadline exceeded.
    #[error("timeout")]
    Timeout,
    /// Output buffer too small; drain and retry.
    #[error("overflow")]
    Overflow,
    /// More input is needed before progress is possible.
    #[error("underflow")]
    Underflow,
    /// Malformed input.
    #[error("bad data")]
    BadData,
    /// Integrity or authenticity check failed.
    #[error("signature check failed")]
    Signature,
    /// Transport read failure.
    #[error("read error")]
    Read,
    /// Transport write failure.
    #[error("write error")]
    Write,
    /// Requested credential or resource is absent.
    #[error("not found")]
    NotFound,
    /// The object suspended waiting for a credential.
    #[error("resource needed")]
    ResourceNeeded,
    /// Completed with a non-fatal residual condition.
    #[error("ok (residual condition)")]
    OkSpecial,
}

impl Status {
    /// Stable integer code.
    pub fn code(self) -> i32 {
        match self {
            Self::BadParam => -1,
            Self::Memory => -10,
            Self::WrongKey => -22,
            Self::Complete => -24,
            Self::Timeout => -25,
            Self::Overflow => -30,
            Self::Underflow => -31,
            Self::BadData => -32,
            Self::Signature => -33,
            Self::Read => -41,
            Self::Write => -42,
            Self::NotFound => -43,
            Self::ResourceNeeded => -50,
            Self::OkSpecial => -4321,
        }
    }

    /// Map an integer code back to a status. `0` and unknown codes map to
    /// `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Self::BadParam,
            -10 => Self::Memory,
            -22 => Self::WrongKey,
            -24 => Self::Complete,
            -25 => Self::Timeout,
            -30 => Self::Overflow,
            -31 => Self::Underflow,
            -32 => Self::BadData,
            -33 => Self::Signature,
            -41 => Self::Read,
            -42 => Self::Write,
            -43 => Self::NotFound,
            -50 => Self::ResourceNeeded,
            -4321 => Self::OkSpecial,
            _ => return None,
        })
    }

    /// Whether the object stays usable after this status.
    ///
    /// `WrongKey` is recoverable only while untried candidates remain; the
    /// object decides that and records the fault itself when they run out.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::Overflow
                | Self::Underflow
                | Self::Timeout
                | Self::ResourceNeeded
                | Self::NotFound
                | Self::WrongKey
                | Self::OkSpecial
                | Self::Complete
        )
    }
}

/// Error returned by engine calls.
///
/// `consumed` reports how many input bytes the failing call absorbed, so a
/// caller can re-submit only the unconsumed tail after an `Overflow`,
/// `Timeout` or `ResourceNeeded` return from `push`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    status: Status,
    consumed: usize,
    detail: Option<String>,
}

impl Error {
    /// Error with no extended information.
    pub fn new(status: Status) -> Self {
        Self {
            status,
            consumed: 0,
            detail: None,
        }
    }

    /// Error with a human-readable extended description.
    pub fn with_detail(status: Status, detail: impl Into<String>) -> Self {
        Self {
            status,
            consumed: 0,
            detail: Some(detail.into()),
        }
    }

    /// Attach the consumed-byte count of the call that failed.
    pub fn consumed_bytes(mut self, consumed: usize) -> Self {
        self.consumed = consumed;
        self
    }

    /// Status kind.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Integer code of the status.
    pub fn code(&self) -> i32 {
        self.status.code()
    }

    /// Input bytes absorbed before the call returned.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Extended error string, if any.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Shorthand for `status().is_recoverable()`.
    pub fn is_recoverable(&self) -> bool {
        self.status.is_recoverable()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.status, detail),
            None => write!(f, "{}", self.status),
        }
    }
}

impl std::error::Error for Error {}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self::new(status)
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;
